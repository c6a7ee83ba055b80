//! Just enough QCOW2 to manage template and instance disks without shelling
//! out for the common cases.
//!
//! # What we do with it
//!
//! - Create **empty** QCOW2 v2 images (blank templates for install-from-ISO).
//! - Read the header of any QCOW2 image to learn its virtual size.
//! - **Grow** an image in place when its L1 table already has room for the
//!   new size, which is the case for every resize whose target fits in the
//!   clusters the L1 table occupies today.  Anything else is left to
//!   `qemu-img resize`.
//!
//! Images we create use 64 KB clusters laid out as header, L1 table,
//! refcount table and refcount block, one cluster each. Format reference:
//! <https://github.com/qemu/qemu/blob/master/docs/interop/qcow2.txt>

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::MoxError;

/// Cluster size for images we create: 64 KB (2^16 bytes).
const CLUSTER_BITS: u32 = 16;
const CLUSTER_SIZE: usize = 1 << CLUSTER_BITS;

/// `QFI\xfb`
const QCOW2_MAGIC: u32 = 0x514649FB;

/// Version written for new images.  Version 2 is the most widely compatible.
const QCOW2_VERSION: u32 = 2;

/// Header length we need to read: the v2 header, plus the v3
/// `incompatible_features` field at offset 72.
const HEADER_READ_LEN: usize = 80;

/// The fields of a QCOW2 header that disk management cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub cluster_bits: u32,
    pub virtual_size: u64,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    /// Always 0 for v2.
    pub incompatible_features: u64,
}

impl Header {
    fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    /// Number of L1 entries the clusters holding the L1 table can carry.
    fn l1_capacity(&self) -> u64 {
        let used = self.l1_size as u64 * 8;
        used.div_ceil(self.cluster_size()) * self.cluster_size() / 8
    }
}

/// Create an empty QCOW2 disk image at `path` with the given virtual size in bytes.
///
/// The resulting file is sparse: a 20 GB image occupies 256 KB on disk.
pub fn create_qcow2(path: &Path, virtual_size: u64) -> Result<(), MoxError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| MoxError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let image = build_qcow2(virtual_size);

    let mut file = std::fs::File::create_new(path)
        .map_err(|e| MoxError::io(format!("creating qcow2 image {}", path.display()), e))?;
    file.write_all(&image)
        .and_then(|()| file.sync_all())
        .map_err(|e| MoxError::io(format!("writing qcow2 image {}", path.display()), e))?;

    tracing::info!(path = %path.display(), virtual_size, "created qcow2 image");
    Ok(())
}

/// Read the QCOW2 header of `path`.  Returns `None` for non-QCOW2 (raw) files.
pub fn read_header(path: &Path) -> Result<Option<Header>, MoxError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| MoxError::io(format!("opening {}", path.display()), e))?;
    let mut buf = [0u8; HEADER_READ_LEN];
    let n = read_up_to(&mut file, &mut buf)
        .map_err(|e| MoxError::io(format!("reading header of {}", path.display()), e))?;
    Ok(parse_header(&buf[..n]))
}

fn parse_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < 72 || read_be32(buf, 0) != QCOW2_MAGIC {
        return None;
    }
    let version = read_be32(buf, 4);
    let incompatible_features = if version >= 3 && buf.len() >= 80 {
        read_be64(buf, 72)
    } else {
        0
    };
    Some(Header {
        version,
        cluster_bits: read_be32(buf, 20),
        virtual_size: read_be64(buf, 24),
        l1_size: read_be32(buf, 36),
        l1_table_offset: read_be64(buf, 40),
        incompatible_features,
    })
}

/// Virtual size of a disk image: the QCOW2 header's size, or the file length for raw images.
pub fn virtual_size(path: &Path) -> Result<u64, MoxError> {
    match read_header(path)? {
        Some(header) => Ok(header.virtual_size),
        None => std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| MoxError::io(format!("reading metadata of {}", path.display()), e)),
    }
}

/// Grow a QCOW2 image to `new_size` by rewriting its header.
///
/// Returns `Ok(false)` without touching the file when the image needs more
/// than a header update (L1 table relocation, feature bits we don't handle);
/// the caller then falls back to `qemu-img resize`.  Never shrinks.
pub fn grow_in_place(path: &Path, new_size: u64) -> Result<bool, MoxError> {
    let Some(header) = read_header(path)? else {
        return Ok(false);
    };
    if new_size <= header.virtual_size {
        return Ok(true);
    }
    // Any incompatible feature (dirty, corrupt, external data, extended L2...)
    // changes the rules; let qemu-img deal with it.
    if header.incompatible_features != 0 || !(9..=21).contains(&header.cluster_bits) {
        return Ok(false);
    }

    let needed = l1_entries_for(new_size, header.cluster_bits);
    if needed > header.l1_capacity() {
        return Ok(false);
    }

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| MoxError::io(format!("opening {} for resize", path.display()), e))?;

    // The slack after the live L1 entries must be unused before we claim it.
    let slack_start = header.l1_table_offset + header.l1_size as u64 * 8;
    let slack_len = (needed - header.l1_size as u64) * 8;
    if slack_len > 0 {
        let mut slack = vec![0u8; slack_len as usize];
        file.seek(SeekFrom::Start(slack_start))
            .and_then(|_| read_up_to(&mut file, &mut slack))
            .map_err(|e| MoxError::io(format!("reading L1 table of {}", path.display()), e))?;
        if slack.iter().any(|b| *b != 0) {
            return Ok(false);
        }
    }

    let io_err = |e| MoxError::io(format!("updating header of {}", path.display()), e);
    file.seek(SeekFrom::Start(24)).map_err(io_err)?;
    file.write_all(&new_size.to_be_bytes()).map_err(io_err)?;
    file.seek(SeekFrom::Start(36)).map_err(io_err)?;
    file.write_all(&(needed as u32).to_be_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    tracing::debug!(
        path = %path.display(),
        from = header.virtual_size,
        to = new_size,
        "grew qcow2 image in place"
    );
    Ok(true)
}

/// Four clusters: header, empty L1 table, refcount table, refcount block.
fn build_qcow2(virtual_size: u64) -> Vec<u8> {
    let mut image = vec![0u8; CLUSTER_SIZE * 4];

    // Header fields not written here (backing file, encryption, snapshots) stay zero.
    let l1_entries = l1_entries_for(virtual_size, CLUSTER_BITS) as u32;
    let l1_offset: u64 = CLUSTER_SIZE as u64;
    let refcount_table_offset: u64 = (CLUSTER_SIZE * 2) as u64;

    write_be32(&mut image, 0, QCOW2_MAGIC);
    write_be32(&mut image, 4, QCOW2_VERSION);
    write_be32(&mut image, 20, CLUSTER_BITS);
    write_be64(&mut image, 24, virtual_size);
    write_be32(&mut image, 36, l1_entries);
    write_be64(&mut image, 40, l1_offset);
    write_be64(&mut image, 48, refcount_table_offset);
    write_be32(&mut image, 56, 1);

    // Refcount table has one entry, the block in cluster 3.
    let refcount_block_offset: u64 = (CLUSTER_SIZE * 3) as u64;
    write_be64(&mut image, CLUSTER_SIZE * 2, refcount_block_offset);

    // Clusters 0..4 each referenced once.
    let rb_start = CLUSTER_SIZE * 3;
    for i in 0..4usize {
        write_be16(&mut image, rb_start + i * 2, 1);
    }

    image
}

/// Number of L1 entries needed for `virtual_size`.
///
/// One L1 entry maps one L2 table of `cluster_size / 8` entries, each pointing
/// at a data cluster: 512 MB per entry with 64 KB clusters.
fn l1_entries_for(virtual_size: u64, cluster_bits: u32) -> u64 {
    let cluster = 1u64 << cluster_bits;
    let bytes_per_l1 = (cluster / 8) * cluster;
    virtual_size.div_ceil(bytes_per_l1)
}

fn read_up_to(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn write_be16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_be_bytes());
}

fn write_be32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_be64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

fn read_be32(buf: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(b)
}

fn read_be64(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn qcow2_has_magic() {
        let image = build_qcow2(GIB);
        assert_eq!(&image[0..4], b"QFI\xfb");
    }

    #[test]
    fn qcow2_is_four_clusters() {
        assert_eq!(build_qcow2(GIB).len(), CLUSTER_SIZE * 4);
    }

    #[test]
    fn l1_entries_small_and_large() {
        // 512 MB per entry with 64 KB clusters
        assert_eq!(l1_entries_for(GIB, CLUSTER_BITS), 2);
        assert_eq!(l1_entries_for(100 * GIB, CLUSTER_BITS), 200);
    }

    #[test]
    fn header_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_qcow2(&path, 20 * GIB).unwrap();

        let header = read_header(&path).unwrap().unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.virtual_size, 20 * GIB);
        assert_eq!(header.l1_size, 40);
        assert_eq!(virtual_size(&path).unwrap(), 20 * GIB);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_qcow2(&path, GIB).unwrap();
        assert!(create_qcow2(&path, GIB).is_err());
    }

    #[test]
    fn raw_file_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert_eq!(read_header(&path).unwrap(), None);
        assert_eq!(virtual_size(&path).unwrap(), 4096);
    }

    #[test]
    fn grow_rewrites_size_and_l1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_qcow2(&path, 10 * GIB).unwrap();

        assert!(grow_in_place(&path, 128 * GIB).unwrap());
        let header = read_header(&path).unwrap().unwrap();
        assert_eq!(header.virtual_size, 128 * GIB);
        assert_eq!(header.l1_size, 256);
        // File length untouched: growth is metadata only.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (CLUSTER_SIZE * 4) as u64
        );
    }

    #[test]
    fn grow_beyond_l1_cluster_defers_to_qemu_img() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_qcow2(&path, GIB).unwrap();
        // One 64 KB L1 cluster holds 8192 entries = 4 TiB.
        assert!(!grow_in_place(&path, 5 * 1024 * GIB).unwrap());
        assert_eq!(virtual_size(&path).unwrap(), GIB);
    }

    #[test]
    fn grow_refuses_when_slack_is_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_qcow2(&path, GIB).unwrap();
        // Scribble right after the two live L1 entries.
        let mut data = std::fs::read(&path).unwrap();
        data[CLUSTER_SIZE + 16] = 0xAA;
        std::fs::write(&path, &data).unwrap();

        assert!(!grow_in_place(&path, 4 * GIB).unwrap());
        assert_eq!(virtual_size(&path).unwrap(), GIB);
    }

    #[test]
    fn grow_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        create_qcow2(&path, 8 * GIB).unwrap();
        assert!(grow_in_place(&path, 4 * GIB).unwrap());
        assert_eq!(virtual_size(&path).unwrap(), 8 * GIB);
    }
}
