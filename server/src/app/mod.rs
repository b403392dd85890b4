pub mod options;
pub mod run;
