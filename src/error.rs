/// Canopy specific errors
#[derive(Debug)]
pub enum CanopyError {
    /// A wrapped io:Error
    Io(std::io::Error),
    /// Tried to insert into the retained-packet ring, but the sequence is too old for it
    SequenceTooOld,
    /// Parsing packet format error
    InvalidPacket,
    /// Parsing NACK format error
    InvalidNack,
    /// A section would not fit into the remaining space of the wire packet
    SectionTooBig,
    /// No peer registered under that id
    NoSuchPeer,
}

impl std::fmt::Display for CanopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for CanopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CanopyError {
    fn from(err: std::io::Error) -> Self {
        CanopyError::Io(err)
    }
}
