pub mod run;
pub mod status;
pub mod test_stage;
