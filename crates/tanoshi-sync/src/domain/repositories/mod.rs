pub mod library;
pub mod track;
