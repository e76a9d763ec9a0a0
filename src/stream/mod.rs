pub mod dispatcher;

pub use dispatcher::{ChangeEvent, Dispatcher, OpType, Subscription};
