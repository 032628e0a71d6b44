pub mod filemoon;
pub mod megacloud;
pub mod vidplay;

pub use filemoon::Filemoon;
pub use megacloud::Megacloud;
pub use vidplay::Vidplay;
