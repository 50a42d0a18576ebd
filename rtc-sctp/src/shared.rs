/// Protocol-level identifier for an Association. Mainly useful for
/// identifying this association's packets on the wire with tools like
/// Wireshark (it is the verification tag, not a stream id).
pub type AssociationId = u32;

#[derive(Debug, Copy, Clone)]
pub struct IssuedAid {
    pub sequence: u64,
    pub id: AssociationId,
}
