pub mod index;
pub mod key;
pub mod node;
pub mod tree;

pub use index::Index;
pub use node::BTreeNode;
pub use tree::BTree;
