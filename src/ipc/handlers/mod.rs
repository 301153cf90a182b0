pub mod attendance;
pub mod bulletins;
pub mod classes;
pub mod core;
pub mod courses;
pub mod grades;
pub mod semesters;
pub mod stats;
pub mod students;
pub mod subjects;
pub mod teachers;
