pub mod actions;
pub mod run;
pub mod validate;
