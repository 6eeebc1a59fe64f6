//! Binary container: header, symbol/value tables, code pages, integrity
//! hash.
//!
//! Layout (all multi-byte integers big endian):
//!
//! ```text
//! offset  size  content
//! 0       4     magic 'a' 'r' 'k' 0x00
//! 4       6     major, minor, patch (u16 each)
//! 10      8     timestamp, seconds since the Unix epoch
//! 18      32    SHA-256 over bytes [50..]
//! 50      ...   symbol table, value table, code pages
//! ```
//!
//! Every page is encoded with one trailing `HALT` guard word so a runaway
//! instruction pointer stops instead of running off the page; the decoder
//! strips it again, making encode/decode a strict round trip.

use sha2::{Digest, Sha256};

use crate::bytecode::{
    CODE_SEGMENT_START, FUNC_TYPE, NUMBER_TYPE, Opcode, STRING_TYPE, SYM_TABLE_START,
    VAL_TABLE_START, Word,
};
use crate::error::{Error, ErrorKind};

const MAGIC: [u8; 4] = [b'a', b'r', b'k', 0x00];
const HEADER_SIZE: usize = 18;
const HASH_SIZE: usize = 32;

/// Crate version triple, stamped into every container.
#[must_use]
pub fn crate_version() -> (u16, u16, u16) {
    let parse = |s: &str| s.parse::<u16>().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

/// One value-table entry.
#[derive(Debug, Clone, PartialEq)]
pub enum TableEntry {
    Number(f64),
    String(String),
    PageAddr(u16),
}

/// A decoded (or about-to-be-encoded) bytecode image.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub version: (u16, u16, u16),
    pub timestamp: u64,
    pub symbols: Vec<String>,
    pub constants: Vec<TableEntry>,
    pub pages: Vec<Vec<Word>>,
}

impl Bytecode {
    /// Serializes to the binary container, computing the integrity hash.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();

        body.push(SYM_TABLE_START);
        push_u16(&mut body, self.symbols.len() as u16);
        for symbol in &self.symbols {
            body.extend_from_slice(symbol.as_bytes());
            body.push(0);
        }

        body.push(VAL_TABLE_START);
        push_u16(&mut body, self.constants.len() as u16);
        for constant in &self.constants {
            match constant {
                TableEntry::Number(n) => {
                    body.push(NUMBER_TYPE);
                    body.extend_from_slice(ryu::Buffer::new().format(*n).as_bytes());
                }
                TableEntry::String(text) => {
                    body.push(STRING_TYPE);
                    body.extend_from_slice(text.as_bytes());
                }
                TableEntry::PageAddr(addr) => {
                    body.push(FUNC_TYPE);
                    push_u16(&mut body, *addr);
                }
            }
            body.push(0);
        }

        if self.pages.is_empty() {
            // never a zero-size segment: a bare NOP page plus the guard
            encode_page(&mut body, &[Word::bare(Opcode::Nop)]);
        }
        for page in &self.pages {
            encode_page(&mut body, page);
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + HASH_SIZE + body.len());
        out.extend_from_slice(&MAGIC);
        push_u16(&mut out, self.version.0);
        push_u16(&mut out, self.version.1);
        push_u16(&mut out, self.version.2);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&Sha256::digest(&body));
        out.extend_from_slice(&body);
        out
    }

    /// Parses and verifies a container.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);
        if reader.take(4)? != MAGIC {
            return Err(vm_error("invalid format: couldn't find magic constant"));
        }
        let version = (reader.u16()?, reader.u16()?, reader.u16()?);
        let current = crate_version();
        if version.0 != current.0 {
            return Err(vm_error(format!(
                "compiler and VM versions don't match: {}.{}.{} and {}.{}.{}",
                version.0, version.1, version.2, current.0, current.1, current.2
            )));
        }
        let timestamp = u64::from_be_bytes(
            reader
                .take(8)?
                .try_into()
                .expect("slice of length 8 converts to [u8; 8]"),
        );

        let stored_hash = reader.take(HASH_SIZE)?.to_vec();
        let computed = Sha256::digest(&bytes[HEADER_SIZE + HASH_SIZE..]);
        if stored_hash != computed.as_slice() {
            return Err(vm_error("integrity check failed"));
        }

        if reader.u8()? != SYM_TABLE_START {
            return Err(vm_error("couldn't find the symbol table"));
        }
        let symbol_count = reader.u16()?;
        let mut symbols = Vec::with_capacity(symbol_count as usize);
        for _ in 0..symbol_count {
            symbols.push(reader.c_string()?);
        }

        if reader.u8()? != VAL_TABLE_START {
            return Err(vm_error("couldn't find the value table"));
        }
        let value_count = reader.u16()?;
        let mut constants = Vec::with_capacity(value_count as usize);
        for index in 0..value_count {
            let tag = reader.u8()?;
            match tag {
                NUMBER_TYPE => {
                    let text = reader.c_string()?;
                    let number = text
                        .parse::<f64>()
                        .map_err(|_| vm_error(format!("malformed number constant {index}")))?;
                    constants.push(TableEntry::Number(number));
                }
                STRING_TYPE => constants.push(TableEntry::String(reader.c_string()?)),
                FUNC_TYPE => {
                    let addr = reader.u16()?;
                    reader.u8()?; // entry terminator
                    constants.push(TableEntry::PageAddr(addr));
                }
                _ => return Err(vm_error(format!("unknown type tag for value {index}"))),
            }
        }

        let mut pages = Vec::new();
        while !reader.at_end() {
            if reader.u8()? != CODE_SEGMENT_START {
                return Err(vm_error("expected a code segment"));
            }
            let byte_size = reader.u16()? as usize;
            if byte_size % 4 != 0 {
                return Err(vm_error("code segment size is not a multiple of 4"));
            }
            let mut page = Vec::with_capacity(byte_size / 4);
            for _ in 0..byte_size / 4 {
                let raw = reader.take(4)?;
                let opcode = Opcode::from_repr(raw[1])
                    .ok_or_else(|| vm_error(format!("unknown instruction: {}", raw[1])))?;
                page.push(Word {
                    padding: raw[0],
                    opcode,
                    arg: u16::from_be_bytes([raw[2], raw[3]]),
                });
            }
            // drop the guard word the encoder appended
            if page.last().map(|w| w.opcode) == Some(Opcode::Halt) {
                page.pop();
            }
            pages.push(page);
        }

        Ok(Self {
            version,
            timestamp,
            symbols,
            constants,
            pages,
        })
    }
}

fn encode_page(out: &mut Vec<u8>, page: &[Word]) {
    let byte_size = 4 * (page.len() + 1);
    assert!(
        byte_size <= usize::from(u16::MAX),
        "page exceeds the maximum size of 2^16 - 1 bytes"
    );
    out.push(CODE_SEGMENT_START);
    push_u16(out, byte_size as u16);
    for word in page {
        out.extend_from_slice(&word.to_bytes());
    }
    out.extend_from_slice(&Word::bare(Opcode::Halt).to_bytes());
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn vm_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Vm, message)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], Error> {
        let end = self.pos + count;
        if end > self.bytes.len() {
            return Err(vm_error("truncated bytecode"));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn c_string(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.bytes.len() {
            return Err(vm_error("unterminated string in bytecode"));
        }
        let text = String::from_utf8(self.bytes[start..self.pos].to_vec())
            .map_err(|_| vm_error("non-UTF-8 string in bytecode"))?;
        self.pos += 1; // the NUL
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> Bytecode {
        Bytecode {
            version: crate_version(),
            timestamp: 1_700_000_000,
            symbols: vec!["x".to_owned(), "counter".to_owned()],
            constants: vec![
                TableEntry::Number(40.0),
                TableEntry::String("hello".to_owned()),
                TableEntry::PageAddr(1),
            ],
            pages: vec![
                vec![
                    Word::new(Opcode::LoadConst, 0),
                    Word::new(Opcode::Store, 0),
                    Word::new(Opcode::LoadSymbol, 0),
                ],
                vec![Word::new(Opcode::Store, 1), Word::bare(Opcode::Ret)],
            ],
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let bytecode = sample();
        let decoded = Bytecode::decode(&bytecode.encode()).expect("decode failed");
        assert_eq!(decoded, bytecode);
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let encoded = sample().encode();
        assert_eq!(&encoded[0..4], b"ark\0");
        let (major, _, _) = crate_version();
        assert_eq!(u16::from_be_bytes([encoded[4], encoded[5]]), major);
        assert_eq!(
            u64::from_be_bytes(encoded[10..18].try_into().expect("8 bytes")),
            1_700_000_000
        );
        // symbol table starts right after the 32-byte hash
        assert_eq!(encoded[50], SYM_TABLE_START);
    }

    #[test]
    fn hash_matches_recomputation() {
        let encoded = sample().encode();
        let recomputed = Sha256::digest(&encoded[50..]);
        assert_eq!(&encoded[18..50], recomputed.as_slice());
    }

    #[test]
    fn corruption_is_detected() {
        let mut encoded = sample().encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = Bytecode::decode(&encoded).expect_err("expected integrity failure");
        assert!(err.message().contains("integrity"));
    }

    #[test]
    fn version_gate_rejects_foreign_majors() {
        let mut bytecode = sample();
        bytecode.version.0 += 1;
        let err = Bytecode::decode(&bytecode.encode()).expect_err("expected version mismatch");
        assert!(err.message().contains("versions don't match"));
    }

    #[test]
    fn pages_end_with_a_guard_halt_on_the_wire() {
        let encoded = sample().encode();
        // last 4 bytes of the container are the guard of the last page
        let guard = &encoded[encoded.len() - 4..];
        assert_eq!(guard[1], Opcode::Halt as u8);
    }

    #[test]
    fn empty_program_still_carries_a_page() {
        let bytecode = Bytecode {
            version: crate_version(),
            timestamp: 0,
            symbols: vec![],
            constants: vec![],
            pages: vec![],
        };
        let decoded = Bytecode::decode(&bytecode.encode()).expect("decode failed");
        assert_eq!(decoded.pages.len(), 1);
        assert_eq!(decoded.pages[0], vec![Word::bare(Opcode::Nop)]);
    }

    #[test]
    fn number_entries_survive_via_shortest_decimal_text() {
        let bytecode = Bytecode {
            version: crate_version(),
            timestamp: 0,
            symbols: vec![],
            constants: vec![TableEntry::Number(0.1), TableEntry::Number(-2.5e300)],
            pages: vec![vec![Word::bare(Opcode::Nop)]],
        };
        let decoded = Bytecode::decode(&bytecode.encode()).expect("decode failed");
        assert_eq!(decoded.constants, bytecode.constants);
    }
}
