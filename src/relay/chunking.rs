// Client-side helpers for splitting a package into parts and putting it back together

use std::collections::BTreeMap;

use super::RelayError;

/// Split a payload into `chunk_size` parts, indexed from zero
pub fn split(data: &[u8], chunk_size: usize) -> Vec<(u32, &[u8])> {
    let chunk_size = chunk_size.max(1);
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, part)| (index as u32, part))
        .collect()
}

/// Rebuild a payload from parts in any order. Every index in `0..total`
/// must be present exactly once; later duplicates overwrite earlier ones.
pub fn reassemble<I>(parts: I, total: u32) -> Result<Vec<u8>, RelayError>
where
    I: IntoIterator<Item = (u32, Vec<u8>)>,
{
    let mut ordered = BTreeMap::new();
    for (index, data) in parts {
        if index >= total {
            return Err(RelayError::InvalidChunk(format!(
                "chunk index {} is outside 0..{}",
                index, total
            )));
        }
        ordered.insert(index, data);
    }

    let missing: Vec<u32> = (0..total).filter(|i| !ordered.contains_key(i)).collect();
    if !missing.is_empty() {
        return Err(RelayError::Incomplete { expected: total, missing });
    }

    Ok(ordered.into_values().flatten().collect())
}
