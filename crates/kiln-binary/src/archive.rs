//! Universal binary archive reading and writing.
//!
//! # Layout (little-endian)
//!
//! ```text
//! "FUBA"  version:u32  count:u32
//! target:u64            x count
//! offset:u64            x count
//! toolchain_version:u32 x count
//! sha256:[u8; 32]       x count
//!
//! at offset[i]:
//!   function_count:u32  function_info_size:u32  binary_size:u32
//!   function_count x {
//!     version:u32  type:u32  arg_count:u32  local_size:[u32; 3]
//!     name (NUL terminated)
//!     arg_count x { size:u32  address_space:u8  image_type:u8  image_access:u8  special_type:u8 }
//!   }
//!   data:[u8; binary_size]
//! ```
//!
//! Binaries are laid out back to back, so the first offset is
//! `12 + 52 * count` and every following one is the previous offset plus
//! `12 + function_info_size + binary_size`.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use kiln_core::FunctionInfo;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::target::Target;
use crate::translate;
use crate::{BinaryError, BinaryResult};

/// File magic.
pub const MAGIC: [u8; 4] = *b"FUBA";

/// Container format version.
pub const FORMAT_VERSION: u32 = 1;

/// Version of the serialized function info records.
pub const FUNCTION_INFO_VERSION: u32 = 1;

const HEADER_SIZE: u64 = 12;
const PER_BINARY_HEADER_SIZE: u64 = 8 + 8 + 4 + 32;
const BINARY_HEADER_SIZE: u64 = 12;
const FUNCTION_HEADER_SIZE: u64 = 4 * 6;
const ARG_SIZE: u64 = 8;

/// Serialized argument metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct ArchiveArgInfo {
    pub size: u32,
    pub address_space: u8,
    pub image_type: u8,
    pub image_access: u8,
    pub special_type: u8,
}

/// Serialized function metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArchiveFunctionInfo {
    /// Record version, [`FUNCTION_INFO_VERSION`].
    pub version: u32,
    /// Raw [`kiln_core::FunctionType`].
    pub function_type: u32,
    /// Required local size, zero if none.
    pub local_size: [u32; 3],
    /// Entry point name.
    pub name: String,
    /// Arguments.
    pub args: Vec<ArchiveArgInfo>,
}

impl ArchiveFunctionInfo {
    /// Bytes this record occupies on disk.
    pub fn serialized_size(&self) -> u64 {
        FUNCTION_HEADER_SIZE + self.name.len() as u64 + 1 + ARG_SIZE * self.args.len() as u64
    }

    fn write<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u32::<LittleEndian>(self.function_type)?;
        w.write_u32::<LittleEndian>(self.args.len() as u32)?;
        for v in self.local_size {
            w.write_u32::<LittleEndian>(v)?;
        }
        w.write_all(self.name.as_bytes())?;
        w.write_u8(0)?;
        for arg in &self.args {
            w.write_u32::<LittleEndian>(arg.size)?;
            w.write_u8(arg.address_space)?;
            w.write_u8(arg.image_type)?;
            w.write_u8(arg.image_access)?;
            w.write_u8(arg.special_type)?;
        }
        Ok(())
    }
}

/// One binary of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveBinary {
    /// What the binary was built for.
    pub target: Target,
    /// Version word of the producing toolchain.
    pub toolchain_version: u32,
    /// SHA-256 of `data`.
    pub hash: [u8; 32],
    /// Entry point metadata.
    pub functions: Vec<ArchiveFunctionInfo>,
    /// Raw binary.
    pub data: Vec<u8>,
}

impl ArchiveBinary {
    /// Runtime metadata of every entry point.
    pub fn function_infos(&self) -> BinaryResult<Vec<FunctionInfo>> {
        translate::to_runtime_all(&self.functions)
    }

    /// Byte size of all serialized function infos.
    pub fn function_info_size(&self) -> u64 {
        self.functions.iter().map(ArchiveFunctionInfo::serialized_size).sum()
    }

    /// Lowercase hex of the hash.
    pub fn hash_hex(&self) -> String {
        self.hash.iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// An in-memory universal binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    /// Binaries in file order.
    pub binaries: Vec<ArchiveBinary>,
}

impl Archive {
    /// Empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a binary, hashing `data`. Returns its index.
    pub fn push(&mut self, target: Target, toolchain_version: u32, functions: Vec<FunctionInfo>, data: Vec<u8>) -> usize {
        self.binaries.push(ArchiveBinary {
            target,
            toolchain_version,
            hash: sha256(&data),
            functions: functions.iter().map(ArchiveFunctionInfo::from).collect(),
            data,
        });
        self.binaries.len() - 1
    }

    /// Number of binaries.
    pub fn len(&self) -> usize {
        self.binaries.len()
    }

    /// No binaries.
    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }

    /// Iterates binaries in file order.
    pub fn iter(&self) -> std::slice::Iter<'_, ArchiveBinary> {
        self.binaries.iter()
    }

    /// Serializes the archive.
    ///
    /// Offsets are written as placeholders first and patched once every
    /// binary's position in the stream is known.
    pub fn write_to<W: Write + Seek>(&self, w: &mut W) -> BinaryResult<()> {
        let too_large = |what: &str, index: usize| {
            BinaryError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("binary #{index}: {what} does not fit in 32 bits"),
            ))
        };

        let count = u32::try_from(self.binaries.len()).map_err(|_| too_large("binary count", 0))?;
        let targets = self.binaries.iter().map(|b| b.target.to_u64()).collect::<BinaryResult<Vec<_>>>()?;
        let start = w.stream_position()?;

        w.write_all(&MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(count)?;
        for &target in &targets {
            w.write_u64::<LittleEndian>(target)?;
        }
        let offsets_pos = w.stream_position()?;
        for _ in &self.binaries {
            w.write_u64::<LittleEndian>(0)?;
        }
        for binary in &self.binaries {
            w.write_u32::<LittleEndian>(binary.toolchain_version)?;
        }
        for binary in &self.binaries {
            w.write_all(&binary.hash)?;
        }

        let mut offsets = Vec::with_capacity(self.binaries.len());
        for (index, binary) in self.binaries.iter().enumerate() {
            offsets.push(w.stream_position()? - start);
            let function_count = u32::try_from(binary.functions.len()).map_err(|_| too_large("function count", index))?;
            let info_size = u32::try_from(binary.function_info_size()).map_err(|_| too_large("function info", index))?;
            let data_size = u32::try_from(binary.data.len()).map_err(|_| too_large("binary", index))?;
            w.write_u32::<LittleEndian>(function_count)?;
            w.write_u32::<LittleEndian>(info_size)?;
            w.write_u32::<LittleEndian>(data_size)?;
            for function in &binary.functions {
                function.write(w)?;
            }
            w.write_all(&binary.data)?;
        }
        let end = w.stream_position()?;

        w.seek(SeekFrom::Start(offsets_pos))?;
        for offset in offsets {
            w.write_u64::<LittleEndian>(offset)?;
        }
        w.seek(SeekFrom::Start(end))?;
        w.flush()?;
        Ok(())
    }

    /// Serializes into a byte vector.
    pub fn to_bytes(&self) -> BinaryResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write_to(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Writes the archive to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> BinaryResult<()> {
        let path = path.as_ref();
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        debug!(path = %path.display(), binaries = self.len(), "wrote universal binary");
        Ok(())
    }

    /// One line per binary: index, target, toolchain, functions, size, hash prefix.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, binary) in self.binaries.iter().enumerate() {
            let names: Vec<&str> = binary.functions.iter().map(|f| f.name.as_str()).collect();
            let _ = writeln!(
                out,
                "#{i} {}  toolchain {}  {} bytes  sha256 {}  [{}]",
                binary.target,
                binary.toolchain_version,
                binary.data.len(),
                &binary.hash_hex()[..16],
                names.join(", "),
            );
        }
        out
    }
}

impl<'a> IntoIterator for &'a Archive {
    type Item = &'a ArchiveBinary;
    type IntoIter = std::slice::Iter<'a, ArchiveBinary>;

    fn into_iter(self) -> Self::IntoIter {
        self.binaries.iter()
    }
}

// =============================================================================
// Loading
// =============================================================================

fn truncated(what: impl Into<String>) -> impl FnOnce(std::io::Error) -> BinaryError {
    let what = what.into();
    move |_| BinaryError::Truncated(what)
}

fn read_function_info(r: &mut Cursor<&[u8]>, index: usize) -> BinaryResult<ArchiveFunctionInfo> {
    let ctx = || format!("function info of binary #{index}");
    let version = r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?;
    if version != FUNCTION_INFO_VERSION {
        return Err(BinaryError::InvalidFunctionInfo {
            index,
            reason: format!("unsupported function info version {version}"),
        });
    }
    let function_type = r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?;
    let arg_count = r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?;
    let mut local_size = [0u32; 3];
    r.read_u32_into::<LittleEndian>(&mut local_size).map_err(truncated(ctx()))?;

    let mut name = Vec::new();
    loop {
        match r.read_u8().map_err(truncated(ctx()))? {
            0 => break,
            b => name.push(b),
        }
    }
    let name = String::from_utf8(name).map_err(|_| BinaryError::InvalidFunctionInfo {
        index,
        reason: "function name is not valid UTF-8".into(),
    })?;

    let remaining = r.get_ref().len() as u64 - r.position();
    if u64::from(arg_count) * ARG_SIZE > remaining {
        return Err(BinaryError::Truncated(format!("arguments of {name} in binary #{index}")));
    }
    let mut args = Vec::with_capacity(arg_count as usize);
    for _ in 0..arg_count {
        args.push(ArchiveArgInfo {
            size: r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?,
            address_space: r.read_u8().map_err(truncated(ctx()))?,
            image_type: r.read_u8().map_err(truncated(ctx()))?,
            image_access: r.read_u8().map_err(truncated(ctx()))?,
            special_type: r.read_u8().map_err(truncated(ctx()))?,
        });
    }

    Ok(ArchiveFunctionInfo {
        version,
        function_type,
        local_size,
        name,
        args,
    })
}

fn parse(bytes: &[u8]) -> BinaryResult<Archive> {
    let total = bytes.len() as u64;
    let mut r = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(truncated("header"))?;
    if magic != MAGIC {
        return Err(BinaryError::InvalidMagic(magic));
    }
    let version = r.read_u32::<LittleEndian>().map_err(truncated("header"))?;
    if version != FORMAT_VERSION {
        return Err(BinaryError::UnsupportedVersion(version));
    }
    let count = r.read_u32::<LittleEndian>().map_err(truncated("header"))? as usize;

    let dynamic_size = PER_BINARY_HEADER_SIZE * count as u64;
    if HEADER_SIZE + dynamic_size > total {
        return Err(BinaryError::Truncated(format!(
            "dynamic header of {count} binaries needs {dynamic_size} bytes"
        )));
    }

    let mut targets = Vec::with_capacity(count);
    for _ in 0..count {
        targets.push(Target::from_u64(r.read_u64::<LittleEndian>().map_err(truncated("targets"))?)?);
    }
    let mut offsets = vec![0u64; count];
    r.read_u64_into::<LittleEndian>(&mut offsets).map_err(truncated("offsets"))?;
    let mut toolchain_versions = vec![0u32; count];
    r.read_u32_into::<LittleEndian>(&mut toolchain_versions).map_err(truncated("toolchain versions"))?;
    let mut hashes = vec![[0u8; 32]; count];
    for hash in &mut hashes {
        r.read_exact(hash).map_err(truncated("hashes"))?;
    }

    let mut binaries = Vec::with_capacity(count);
    let mut expected_offset = HEADER_SIZE + dynamic_size;
    for (index, target) in targets.into_iter().enumerate() {
        let offset = offsets[index];
        if offset != expected_offset {
            return Err(BinaryError::OffsetMismatch { index, expected: expected_offset, found: offset });
        }
        r.set_position(offset);

        let ctx = || format!("header of binary #{index}");
        let function_count = r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?;
        let function_info_size = r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?;
        let binary_size = r.read_u32::<LittleEndian>().map_err(truncated(ctx()))?;

        let info_start = r.position();
        let mut functions = Vec::new();
        for _ in 0..function_count {
            functions.push(read_function_info(&mut r, index)?);
        }
        let parsed = r.position() - info_start;
        if parsed != u64::from(function_info_size) {
            return Err(BinaryError::FunctionInfoSizeMismatch { index, expected: function_info_size, parsed });
        }

        let available = total - r.position();
        if u64::from(binary_size) > available {
            return Err(BinaryError::BinarySizeMismatch { index, expected: binary_size, available });
        }
        let mut data = vec![0u8; binary_size as usize];
        r.read_exact(&mut data).map_err(truncated(format!("data of binary #{index}")))?;

        if sha256(&data) != hashes[index] {
            return Err(BinaryError::HashMismatch { index });
        }

        expected_offset = offset + BINARY_HEADER_SIZE + u64::from(function_info_size) + u64::from(binary_size);
        binaries.push(ArchiveBinary {
            target,
            toolchain_version: toolchain_versions[index],
            hash: hashes[index],
            functions,
            data,
        });
    }

    Ok(Archive { binaries })
}

/// Parses and verifies an archive held in memory.
///
/// Every structural check (magic, version, header sizes, target descriptors,
/// offsets, function info sizes, binary sizes) and the SHA-256 of each binary
/// must pass, otherwise nothing is returned.
pub fn load_archive_from_memory(bytes: &[u8]) -> BinaryResult<Archive> {
    match parse(bytes) {
        Ok(archive) => {
            debug!(bytes = bytes.len(), binaries = archive.len(), "loaded universal binary");
            Ok(archive)
        }
        Err(e) => {
            error!(error = %e, "invalid universal binary");
            Err(e)
        }
    }
}

/// Reads and verifies an archive file.
pub fn load_archive(path: impl AsRef<Path>) -> BinaryResult<Archive> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "failed to read universal binary");
        e
    })?;
    parse(&bytes).map_err(|e| {
        error!(path = %path.display(), error = %e, "invalid universal binary");
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{CudaTarget, HostTarget};
    use kiln_core::{ArgInfo, HostArch};

    fn sample() -> Archive {
        let mut archive = Archive::new();
        archive.push(
            Target::Cuda(CudaTarget::ptx((7, 5), (6, 3))),
            10203,
            vec![FunctionInfo::kernel("add", vec![ArgInfo::buffer(), ArgInfo::value(4)])],
            b".version 6.3".to_vec(),
        );
        archive.push(
            Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 2 }),
            10203,
            vec![FunctionInfo::kernel("add", vec![]), FunctionInfo::kernel("mul", vec![])],
            vec![0x7f, b'E', b'L', b'F'],
        );
        archive
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"FUBA");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), FORMAT_VERSION);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 2);

        let first = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        assert_eq!(first, 12 + 52 * 2);
        let second = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        let archive = sample();
        let b0 = &archive.binaries[0];
        assert_eq!(second, first + 12 + b0.function_info_size() + b0.data.len() as u64);
    }

    #[test]
    fn test_function_info_size() {
        let info = ArchiveFunctionInfo::from(&FunctionInfo::kernel("add", vec![ArgInfo::buffer(); 3]));
        assert_eq!(info.serialized_size(), 24 + 4 + 24);
    }

    #[test]
    fn test_memory_round_trip() {
        let archive = sample();
        let loaded = load_archive_from_memory(&archive.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded, archive);
        assert_eq!(loaded.binaries[0].function_infos().unwrap()[0].name, "add");
    }

    #[test]
    fn test_unencodable_target_rejected() {
        let mut archive = sample();
        archive.push(Target::Host(HostTarget { arch: HostArch::X86_64, cpu_tier: 300 }), 10203, vec![], vec![0]);
        assert!(matches!(archive.to_bytes(), Err(BinaryError::InvalidTarget(_))));
    }

    #[test]
    fn test_empty_archive() {
        let bytes = Archive::new().to_bytes().unwrap();
        assert_eq!(bytes.len(), 12);
        assert!(load_archive_from_memory(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(load_archive_from_memory(&bytes), Err(BinaryError::InvalidMagic(_))));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[4] = 2;
        assert!(matches!(load_archive_from_memory(&bytes), Err(BinaryError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(load_archive_from_memory(&bytes[..20]), Err(BinaryError::Truncated(_))));
        let err = load_archive_from_memory(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, BinaryError::BinarySizeMismatch { index: 1, .. }));
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_rejects_offset_mismatch() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[36] ^= 1;
        assert!(matches!(load_archive_from_memory(&bytes), Err(BinaryError::OffsetMismatch { index: 1, .. })));
    }

    #[test]
    fn test_rejects_function_info_size_mismatch() {
        let mut bytes = sample().to_bytes().unwrap();
        let offset = 12 + 52 * 2;
        bytes[offset + 4] += 1;
        assert!(matches!(
            load_archive_from_memory(&bytes),
            Err(BinaryError::FunctionInfoSizeMismatch { index: 0, .. })
        ));
    }
}
