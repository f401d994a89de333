pub mod balanced_tree;

pub use balanced_tree::BalancedTree;
pub use balanced_tree::Comparator;
pub use balanced_tree::Iter;
pub use balanced_tree::NaturalOrder;
pub use balanced_tree::NodeView;
pub use balanced_tree::Rotation;
pub use balanced_tree::RotationEvent;
