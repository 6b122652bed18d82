// formsync-common: shared types and the patch/wire vocabulary for the formsync workspace

pub mod patch;
pub mod protocol;
pub mod types;
