pub mod hls;
pub mod html;
pub mod http;
pub mod inline;
pub mod registry;
