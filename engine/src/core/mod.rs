pub mod app_dirs;
pub mod paths;
pub mod seams;
pub mod version;
