pub mod backup;
pub mod core;
pub mod materials;
pub mod reports;
pub mod returns;
pub mod students;
