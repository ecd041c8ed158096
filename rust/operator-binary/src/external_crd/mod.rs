pub mod apiregistration;
pub mod cert_manager;
pub mod olm;
pub mod rhacm;
