pub mod api_secret;

pub use api_secret::api_secret_matches;
