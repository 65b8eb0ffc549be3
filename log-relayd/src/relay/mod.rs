pub mod broadcaster;
pub mod ingress;
pub mod viewer;
