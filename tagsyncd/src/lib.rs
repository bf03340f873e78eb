pub mod daemon;
pub mod logging;
pub mod settings;
pub mod sync;
