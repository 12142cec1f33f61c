pub mod clock;
pub mod logger;

pub use clock::now_ts;
pub use logger::init_logger;
