pub mod annotations;
pub mod crd;
pub mod labels;
pub mod network_selection;
