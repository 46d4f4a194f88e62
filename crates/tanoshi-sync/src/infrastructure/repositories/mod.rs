pub mod credential;
pub mod library;
pub mod track;
