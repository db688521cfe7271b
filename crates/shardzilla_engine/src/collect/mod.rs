pub mod collector;
pub mod facet;
pub mod matcher;
pub mod sort;

pub use collector::{collect, group_collapse, CollectParams, Collected, ForeignKeyBound};
