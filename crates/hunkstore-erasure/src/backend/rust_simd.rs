//! Pure Rust SIMD backend using reed-solomon-simd
//!
//! This backend provides portable erasure coding using the `reed-solomon-simd`
//! crate, which automatically uses SIMD instructions where available (SSE, AVX,
//! NEON). Part sizes must be even.

use super::{BackendCapabilities, BackendResult, ErasureBackend, LrcConfig};
use crate::ErasureError;
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

const MAX_TOTAL_PARTS: usize = 255;

fn check_parts(data_parts: &[&[u8]], expected: usize, part_size: usize) -> BackendResult<()> {
    if data_parts.len() != expected {
        return Err(ErasureError::InvalidConfig(format!(
            "expected {expected} data parts, got {}",
            data_parts.len()
        )));
    }
    if let Some((i, part)) = data_parts
        .iter()
        .enumerate()
        .find(|(_, p)| p.len() != part_size)
    {
        return Err(ErasureError::PartSizeMismatch {
            index: i,
            size: part.len(),
            expected: part_size,
        });
    }
    Ok(())
}

/// Compute `recovery_count` Reed-Solomon recovery parts over `data_parts`
fn rs_encode(
    data_parts: &[&[u8]],
    recovery_count: usize,
    part_size: usize,
) -> BackendResult<Vec<Vec<u8>>> {
    let mut encoder = ReedSolomonEncoder::new(data_parts.len(), recovery_count, part_size)
        .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;

    for part in data_parts {
        encoder
            .add_original_shard(part)
            .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;
    }

    let result = encoder
        .encode()
        .map_err(|e| ErasureError::EncodingFailed(e.to_string()))?;

    Ok(result.recovery_iter().map(<[u8]>::to_vec).collect())
}

/// Restore missing data parts from data parts and RS recovery parts
fn rs_restore(
    data: &mut [Option<Vec<u8>>],
    recovery: &[Option<&[u8]>],
    part_size: usize,
) -> BackendResult<()> {
    let k = data.len();
    let mut decoder = ReedSolomonDecoder::new(k, recovery.len(), part_size)
        .map_err(|e| ErasureError::InvalidConfig(e.to_string()))?;

    for (i, part) in data.iter().enumerate() {
        if let Some(part) = part {
            decoder
                .add_original_shard(i, part)
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        }
    }
    for (i, part) in recovery.iter().enumerate() {
        if let Some(part) = part {
            decoder
                .add_recovery_shard(i, part)
                .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;
        }
    }

    let result = decoder
        .decode()
        .map_err(|e| ErasureError::DecodingFailed(e.to_string()))?;

    for (i, slot) in data.iter_mut().enumerate() {
        if slot.is_none() {
            let restored = result.restored_original(i).ok_or_else(|| {
                ErasureError::DecodingFailed(format!("failed to restore data part {i}"))
            })?;
            *slot = Some(restored.to_vec());
        }
    }
    Ok(())
}

/// MDS Reed-Solomon backend using reed-solomon-simd
///
/// Any k parts can reconstruct the block.
pub struct RustSimdBackend {
    data_parts: u8,
    parity_parts: u8,
}

impl RustSimdBackend {
    /// Create a new MDS backend
    pub fn new(data_parts: u8, parity_parts: u8) -> Result<Self, ErasureError> {
        if data_parts == 0 {
            return Err(ErasureError::InvalidConfig("data_parts must be > 0".into()));
        }
        if parity_parts == 0 {
            return Err(ErasureError::InvalidConfig(
                "parity_parts must be > 0".into(),
            ));
        }
        if data_parts as usize + parity_parts as usize > MAX_TOTAL_PARTS {
            return Err(ErasureError::InvalidConfig(format!(
                "total parts must be <= {MAX_TOTAL_PARTS}"
            )));
        }
        Ok(Self {
            data_parts,
            parity_parts,
        })
    }
}

impl ErasureBackend for RustSimdBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "rust_simd",
            supports_lrc: false,
            max_total_parts: MAX_TOTAL_PARTS,
        }
    }

    fn data_parts(&self) -> usize {
        self.data_parts as usize
    }

    fn parity_parts(&self) -> usize {
        self.parity_parts as usize
    }

    fn encode(&self, data_parts: &[&[u8]], part_size: usize) -> BackendResult<Vec<Vec<u8>>> {
        check_parts(data_parts, self.data_parts(), part_size)?;
        let parity = rs_encode(data_parts, self.parity_parts(), part_size)?;

        let mut parts: Vec<Vec<u8>> = data_parts.iter().map(|p| p.to_vec()).collect();
        parts.extend(parity);
        Ok(parts)
    }

    fn reconstruct(
        &self,
        parts: &[Option<&[u8]>],
        part_size: usize,
    ) -> BackendResult<Vec<Vec<u8>>> {
        let k = self.data_parts();
        if parts.len() != self.total_parts() {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {} parts, got {}",
                self.total_parts(),
                parts.len()
            )));
        }

        let available = parts.iter().filter(|p| p.is_some()).count();
        if available < k {
            return Err(ErasureError::InsufficientParts {
                available,
                required: k,
            });
        }

        let mut data: Vec<Option<Vec<u8>>> = parts[..k].iter().map(|p| p.map(<[u8]>::to_vec)).collect();
        if data.iter().any(Option::is_none) {
            rs_restore(&mut data, &parts[k..], part_size)?;
        }

        let data: Vec<Vec<u8>> = data.into_iter().flatten().collect();
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        self.encode(&refs, part_size)
    }
}

/// LRC backend using reed-solomon-simd with layered encoding
///
/// - Data parts are divided into local groups
/// - Each group has a local parity (XOR of group)
/// - Global parity parts are Reed-Solomon over all data
///
/// Part order: data, local parity, global parity.
pub struct RustSimdLrcBackend {
    config: LrcConfig,
}

impl RustSimdLrcBackend {
    /// Create a new LRC backend
    pub fn new(config: LrcConfig) -> Result<Self, ErasureError> {
        if config.data_parts == 0 {
            return Err(ErasureError::InvalidConfig("data_parts must be > 0".into()));
        }
        if config.local_parity_parts == 0 || config.global_parity_parts == 0 {
            return Err(ErasureError::InvalidConfig(
                "local and global parity parts must be > 0".into(),
            ));
        }
        if !config.data_parts.is_multiple_of(config.local_parity_parts) {
            return Err(ErasureError::InvalidConfig(
                "data_parts must be divisible by local_parity_parts".into(),
            ));
        }
        if config.total_parts() > MAX_TOTAL_PARTS {
            return Err(ErasureError::InvalidConfig(format!(
                "total parts must be <= {MAX_TOTAL_PARTS}"
            )));
        }
        Ok(Self { config })
    }

    /// LRC configuration
    #[must_use]
    pub const fn config(&self) -> &LrcConfig {
        &self.config
    }

    fn xor_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>, part_size: usize) -> Vec<u8> {
        let mut result = vec![0u8; part_size];
        for part in parts {
            for (out, byte) in result.iter_mut().zip(part) {
                *out ^= byte;
            }
        }
        result
    }

    /// Part indices of a local group: its data parts and its local parity
    fn group_members(&self, group: usize) -> Vec<usize> {
        let size = self.config.local_group_size();
        let mut members: Vec<usize> = (group * size..(group + 1) * size).collect();
        members.push(self.config.data_parts as usize + group);
        members
    }

    /// Repeatedly fill single holes in local groups; returns true on progress
    fn local_pass(&self, present: &mut [bool]) -> bool {
        let mut progressed = false;
        for group in 0..self.config.local_parity_parts as usize {
            let members = self.group_members(group);
            let missing: Vec<usize> = members.iter().copied().filter(|&i| !present[i]).collect();
            if let [only] = missing[..] {
                present[only] = true;
                progressed = true;
            }
        }
        progressed
    }
}

impl ErasureBackend for RustSimdLrcBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "rust_simd_lrc",
            supports_lrc: true,
            max_total_parts: MAX_TOTAL_PARTS,
        }
    }

    fn data_parts(&self) -> usize {
        self.config.data_parts as usize
    }

    fn parity_parts(&self) -> usize {
        self.config.local_parity_parts as usize + self.config.global_parity_parts as usize
    }

    fn can_reconstruct(&self, available: &[bool]) -> bool {
        if available.len() != self.total_parts() {
            return false;
        }
        let k = self.data_parts();
        let mut present = available.to_vec();
        while self.local_pass(&mut present) {}

        let missing_data = present[..k].iter().filter(|p| !**p).count();
        let global_start = k + self.config.local_parity_parts as usize;
        let available_global = present[global_start..].iter().filter(|p| **p).count();
        missing_data <= available_global
    }

    fn encode(&self, data_parts: &[&[u8]], part_size: usize) -> BackendResult<Vec<Vec<u8>>> {
        check_parts(data_parts, self.data_parts(), part_size)?;

        let group_size = self.config.local_group_size();
        let mut parts: Vec<Vec<u8>> = data_parts.iter().map(|p| p.to_vec()).collect();
        for group in data_parts.chunks(group_size) {
            parts.push(Self::xor_parts(group.iter().copied(), part_size));
        }
        parts.extend(rs_encode(
            data_parts,
            self.config.global_parity_parts as usize,
            part_size,
        )?);
        Ok(parts)
    }

    fn reconstruct(
        &self,
        parts: &[Option<&[u8]>],
        part_size: usize,
    ) -> BackendResult<Vec<Vec<u8>>> {
        let k = self.data_parts();
        let total = self.total_parts();
        if parts.len() != total {
            return Err(ErasureError::InvalidConfig(format!(
                "expected {total} parts, got {}",
                parts.len()
            )));
        }

        let available: Vec<bool> = parts.iter().map(Option::is_some).collect();
        if !self.can_reconstruct(&available) {
            return Err(ErasureError::InsufficientParts {
                available: available.iter().filter(|a| **a).count(),
                required: k,
            });
        }

        let mut owned: Vec<Option<Vec<u8>>> = parts.iter().map(|p| p.map(<[u8]>::to_vec)).collect();

        // Local repair: a group with a single hole is fixed by XOR of the rest.
        loop {
            let mut progressed = false;
            for group in 0..self.config.local_parity_parts as usize {
                let members = self.group_members(group);
                let missing: Vec<usize> =
                    members.iter().copied().filter(|&i| owned[i].is_none()).collect();
                if let [only] = missing[..] {
                    let recovered = Self::xor_parts(
                        members
                            .iter()
                            .filter(|&&i| i != only)
                            .filter_map(|&i| owned[i].as_deref()),
                        part_size,
                    );
                    owned[only] = Some(recovered);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let global_start = k + self.config.local_parity_parts as usize;
        let mut data: Vec<Option<Vec<u8>>> = owned[..k].to_vec();
        if data.iter().any(Option::is_none) {
            let recovery: Vec<Option<&[u8]>> =
                owned[global_start..].iter().map(Option::as_deref).collect();
            rs_restore(&mut data, &recovery, part_size)?;
        }

        let data: Vec<Vec<u8>> = data.into_iter().flatten().collect();
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        self.encode(&refs, part_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parts(k: usize, part_size: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..part_size).map(|j| ((i * 31 + j * 7) % 251) as u8).collect())
            .collect()
    }

    #[test]
    fn test_mds_reconstruct_data_and_parity() {
        let backend = RustSimdBackend::new(6, 3).unwrap();
        let data = sample_parts(6, 64);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let encoded = backend.encode(&refs, 64).unwrap();
        assert_eq!(encoded.len(), 9);

        let mut partial: Vec<Option<&[u8]>> = encoded.iter().map(|p| Some(p.as_slice())).collect();
        partial[0] = None;
        partial[1] = None;
        partial[7] = None;

        let rebuilt = backend.reconstruct(&partial, 64).unwrap();
        assert_eq!(rebuilt, encoded);
    }

    #[test]
    fn test_mds_insufficient_parts() {
        let backend = RustSimdBackend::new(6, 3).unwrap();
        let data = sample_parts(6, 64);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let encoded = backend.encode(&refs, 64).unwrap();

        let mut partial: Vec<Option<&[u8]>> = encoded.iter().map(|p| Some(p.as_slice())).collect();
        for i in [0, 1, 2, 8] {
            partial[i] = None;
        }
        let available: Vec<bool> = partial.iter().map(Option::is_some).collect();
        assert!(!backend.can_reconstruct(&available));
        assert!(matches!(
            backend.reconstruct(&partial, 64),
            Err(ErasureError::InsufficientParts { available: 5, required: 6 })
        ));
    }

    #[test]
    fn test_mds_verify() {
        let backend = RustSimdBackend::new(4, 2).unwrap();
        let data = sample_parts(4, 64);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let mut encoded = backend.encode(&refs, 64).unwrap();

        let all: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        assert!(backend.verify(&all).unwrap());

        encoded[5][0] ^= 0xFF;
        let all: Vec<&[u8]> = encoded.iter().map(Vec::as_slice).collect();
        assert!(!backend.verify(&all).unwrap());
    }

    #[test]
    fn test_lrc_local_repair() {
        let backend = RustSimdLrcBackend::new(LrcConfig::new(6, 2, 2)).unwrap();
        let data = sample_parts(6, 64);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let encoded = backend.encode(&refs, 64).unwrap();
        assert_eq!(encoded.len(), 10);

        // One hole in each local group, plus a lost global parity part.
        let mut partial: Vec<Option<&[u8]>> = encoded.iter().map(|p| Some(p.as_slice())).collect();
        partial[1] = None;
        partial[4] = None;
        partial[9] = None;

        let rebuilt = backend.reconstruct(&partial, 64).unwrap();
        assert_eq!(rebuilt, encoded);
    }

    #[test]
    fn test_lrc_global_repair() {
        let backend = RustSimdLrcBackend::new(LrcConfig::new(6, 2, 2)).unwrap();
        let data = sample_parts(6, 64);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let encoded = backend.encode(&refs, 64).unwrap();

        // Two holes in the first group need the global parity.
        let mut partial: Vec<Option<&[u8]>> = encoded.iter().map(|p| Some(p.as_slice())).collect();
        partial[0] = None;
        partial[2] = None;

        let rebuilt = backend.reconstruct(&partial, 64).unwrap();
        assert_eq!(rebuilt, encoded);
    }

    #[test]
    fn test_lrc_unrecoverable() {
        let backend = RustSimdLrcBackend::new(LrcConfig::new(6, 2, 2)).unwrap();
        let mut available = vec![true; 10];
        for i in [0, 1, 2, 8, 9] {
            available[i] = false;
        }
        assert!(!backend.can_reconstruct(&available));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(RustSimdBackend::new(0, 2).is_err());
        assert!(RustSimdBackend::new(4, 0).is_err());
        assert!(RustSimdLrcBackend::new(LrcConfig::new(7, 2, 2)).is_err());
    }
}
