pub mod admin;
pub mod check;
pub mod history;
pub mod run;
pub mod sources;
pub mod sweep;
