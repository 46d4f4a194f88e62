pub mod locks;
pub mod tracker;
