use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use std::collections::HashMap;
use url::Url;

use crate::core::error::UnitError;
use crate::core::model::{ByteRange, Segment, SegmentStatus};

pub enum Parsed {
    /// The chosen rendition's playlist URL.
    Master(Url),
    Media(Vec<Segment>),
}

pub fn parse(bytes: &[u8], base: &Url) -> Result<Parsed, UnitError> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(Playlist::MasterPlaylist(pl)) => select_variant(&pl, base).map(Parsed::Master),
        Ok(Playlist::MediaPlaylist(pl)) => media_segments(&pl, base).map(Parsed::Media),
        Err(e) => Err(UnitError::PlaylistParse(format!("{base}: {e}"))),
    }
}

/// Highest declared bandwidth wins; ties keep manifest order.
pub fn select_variant(master: &MasterPlaylist, base: &Url) -> Result<Url, UnitError> {
    let mut best: Option<&m3u8_rs::VariantStream> = None;
    for v in master.variants.iter().filter(|v| !v.is_i_frame) {
        if best.map_or(true, |b| v.bandwidth > b.bandwidth) {
            best = Some(v);
        }
    }
    let chosen = best.ok_or_else(|| UnitError::PlaylistParse(format!("{base}: master playlist has no variants")))?;
    base.join(&chosen.uri)
        .map_err(|e| UnitError::PlaylistParse(format!("variant uri {}: {e}", chosen.uri)))
}

pub fn media_segments(media: &MediaPlaylist, base: &Url) -> Result<Vec<Segment>, UnitError> {
    if media.segments.is_empty() {
        return Err(UnitError::PlaylistParse(format!("{base}: playlist has no segments")));
    }
    // An omitted byte-range offset continues where the previous range of
    // the same resource ended.
    let mut range_end: HashMap<String, u64> = HashMap::new();
    let mut out = Vec::with_capacity(media.segments.len());
    for (i, s) in media.segments.iter().enumerate() {
        let uri = base
            .join(&s.uri)
            .map_err(|e| UnitError::PlaylistParse(format!("segment uri {}: {e}", s.uri)))?
            .to_string();
        let byte_range = match s.byte_range.as_ref() {
            Some(r) => {
                let offset = r.offset.unwrap_or_else(|| range_end.get(&uri).copied().unwrap_or(0));
                let range = ByteRange { length: r.length, offset };
                let end = range
                    .end()
                    .ok_or_else(|| UnitError::PlaylistParse(format!("{uri}: byte range {}@{offset} overflows", r.length)))?;
                range_end.insert(uri.clone(), end);
                Some(range)
            }
            None => None,
        };
        let sequence_index = u64::try_from(i)
            .ok()
            .and_then(|i| media.media_sequence.checked_add(i))
            .ok_or_else(|| UnitError::PlaylistParse(format!("{base}: media sequence {} overflows", media.media_sequence)))?;
        out.push(Segment { sequence_index, uri, byte_range, status: SegmentStatus::Pending });
    }
    Ok(out)
}
