#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]

pub mod error;
pub mod util;
pub mod os;
pub mod procfs;
pub mod threads;
pub mod pagemap;
pub mod staging;
pub mod precopy;
pub mod elfcore;
pub mod dumper;
