pub mod authz;
pub mod enrollment;
pub mod health;
pub mod me;
pub mod step_up;
