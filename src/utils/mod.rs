mod string;

pub use string::{short_id, slug, truncate_str};
