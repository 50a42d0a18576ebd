/// Equal to UDP MTU
pub(crate) const RECEIVE_MTU: usize = 1460;

pub(crate) const GENERATED_CERTIFICATE_ORIGIN: &str = "WebRTC";
