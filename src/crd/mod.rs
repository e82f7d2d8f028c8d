//! Custom Resource Definitions for the Micro operator

mod micro;

pub use micro::{Micro, MicroSpec, MicroStatus};
