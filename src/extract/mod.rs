pub mod detail;
pub mod html;
pub mod listing;

pub use detail::extract_details;
pub use listing::{extract_listing, ListTermination};
