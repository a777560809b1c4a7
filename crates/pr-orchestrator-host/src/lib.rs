pub mod github;

pub use github::GitHubHostAdapter;
