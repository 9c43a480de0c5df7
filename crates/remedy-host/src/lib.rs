pub mod github;
pub mod types;
pub mod url;

pub use github::GithubClient;
