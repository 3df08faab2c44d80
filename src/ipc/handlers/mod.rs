pub mod attendance;
pub mod core;
pub mod directory;
pub mod enforcement;
pub mod grades;
pub mod report_card;
pub mod semesters;
