#![deny(dead_code)]
#![deny(unused_imports)]

pub mod assoc;
pub mod data;
pub mod merge;
pub mod model;
pub mod select;
