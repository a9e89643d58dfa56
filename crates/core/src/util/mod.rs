pub mod jobs;
pub mod ordered;

pub use jobs::JobThread;
pub use ordered::OrderedNotify;
