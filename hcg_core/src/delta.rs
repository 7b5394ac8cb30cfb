//! Byte-wise delta transform over raw pixel buffers.
//!
//! `diff` and `merge` are exact inverses modulo 256 for a fixed reference.

use crate::error::{HcgError, Result};

/// `data[i] - reference[i] (mod 256)` for every position.
pub fn diff(data: &[u8], reference: &[u8]) -> Result<Vec<u8>> {
    check_len(data, reference)?;
    Ok(data
        .iter()
        .zip(reference)
        .map(|(&d, &r)| d.wrapping_sub(r))
        .collect())
}

/// `data[i] + reference[i] (mod 256)` for every position.
pub fn merge(data: &[u8], reference: &[u8]) -> Result<Vec<u8>> {
    check_len(data, reference)?;
    Ok(data
        .iter()
        .zip(reference)
        .map(|(&d, &r)| d.wrapping_add(r))
        .collect())
}

/// In-place [`merge`], used when the delta buffer is already owned.
pub fn merge_in_place(data: &mut [u8], reference: &[u8]) -> Result<()> {
    check_len(data, reference)?;
    for (d, &r) in data.iter_mut().zip(reference) {
        *d = d.wrapping_add(r);
    }
    Ok(())
}

fn check_len(data: &[u8], reference: &[u8]) -> Result<()> {
    if data.len() != reference.len() {
        return Err(HcgError::ShapeMismatch(format!(
            "delta buffers differ in length: {} vs {}",
            data.len(),
            reference.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Vec<u8>, Vec<u8>) {
        let data: Vec<u8> = (0..=255u8).collect();
        let reference: Vec<u8> = data.iter().map(|b| b.wrapping_add(100)).collect();
        (data, reference)
    }

    #[test]
    fn diff_wraps_below_zero() {
        let (data, reference) = fixture();
        assert_eq!(diff(&data, &reference).unwrap(), vec![0x9c; 256]);
    }

    #[test]
    fn merge_wraps_above_255() {
        let (data, reference) = fixture();
        assert_eq!(merge(&[0x9c; 256], &reference).unwrap(), data);
    }

    #[test]
    fn round_trips_both_ways() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 + i / 13) as u8).collect();
        let reference: Vec<u8> = (0..4096u32).map(|i| (i * 31 ^ 0x5a) as u8).collect();

        let forward = diff(&data, &reference).unwrap();
        assert_eq!(merge(&forward, &reference).unwrap(), data);

        let backward = merge(&data, &reference).unwrap();
        assert_eq!(diff(&backward, &reference).unwrap(), data);

        let mut in_place = forward;
        merge_in_place(&mut in_place, &reference).unwrap();
        assert_eq!(in_place, data);
    }

    #[test]
    fn unequal_lengths_are_rejected() {
        assert!(matches!(diff(&[1, 2, 3], &[1, 2]), Err(HcgError::ShapeMismatch(_))));
        assert!(matches!(merge(&[1], &[]), Err(HcgError::ShapeMismatch(_))));
        assert!(matches!(
            merge_in_place(&mut [1, 2], &[1]),
            Err(HcgError::ShapeMismatch(_))
        ));
    }
}
