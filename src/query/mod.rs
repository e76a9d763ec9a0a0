pub mod executor;
pub mod expr;
pub mod plan;

pub use executor::{DocIter, Plan, Query};
pub use expr::{Expr, Op};
pub use plan::plan_query;
