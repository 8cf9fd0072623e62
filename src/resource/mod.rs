pub mod recorder;
pub mod screen;
