//! TPM2 response header codec

/// Size of the fixed response header: tag, size, response code.
pub const TPM_HEADER_SIZE: usize = 10;

/// Tag of a response without sessions.
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;

/// The parsed 10-byte response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub tag: u16,
    /// Total frame length, header included.
    pub size: u32,
    pub code: u32,
}

struct HeaderCursor<'a> {
    buffer: &'a [u8; TPM_HEADER_SIZE],
    position: usize,
}

impl<'a> HeaderCursor<'a> {
    fn new(buffer: &'a [u8; TPM_HEADER_SIZE]) -> Self {
        HeaderCursor {
            buffer,
            position: 0,
        }
    }

    fn read_u16(&mut self) -> u16 {
        let value = u16::from_be_bytes([self.buffer[self.position], self.buffer[self.position + 1]]);
        self.position += 2;
        value
    }

    fn read_u32(&mut self) -> u32 {
        let value = u32::from_be_bytes([
            self.buffer[self.position],
            self.buffer[self.position + 1],
            self.buffer[self.position + 2],
            self.buffer[self.position + 3],
        ]);
        self.position += 4;
        value
    }
}

impl ResponseHeader {
    pub fn new(tag: u16, size: u32, code: u32) -> Self {
        ResponseHeader { tag, size, code }
    }

    /// Parse a complete header.
    pub fn parse(bytes: &[u8; TPM_HEADER_SIZE]) -> Self {
        let mut cursor = HeaderCursor::new(bytes);
        let tag = cursor.read_u16();
        let size = cursor.read_u32();
        let code = cursor.read_u32();
        ResponseHeader { tag, size, code }
    }

    /// Parse the first [`TPM_HEADER_SIZE`] bytes of `bytes`, if there are enough.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..TPM_HEADER_SIZE)?.try_into().ok()?;
        Some(Self::parse(header))
    }

    pub fn to_bytes(&self) -> [u8; TPM_HEADER_SIZE] {
        let mut bytes = [0u8; TPM_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.tag.to_be_bytes());
        bytes[2..6].copy_from_slice(&self.size.to_be_bytes());
        bytes[6..10].copy_from_slice(&self.code.to_be_bytes());
        bytes
    }

    /// A header must at least account for itself.
    pub fn is_well_formed(&self) -> bool {
        self.size as usize >= TPM_HEADER_SIZE
    }
}
