mod generator;
mod multi;
mod range;

pub use generator::{HiLoIdGenerator, NextHiLoResult};
pub use multi::{MultiDatabaseHiLoIdGenerator, MultiTypeHiLoIdGenerator};
pub use range::IdRange;
