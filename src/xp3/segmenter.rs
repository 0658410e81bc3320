//! Strategies that split a file into stored segments.
use super::error::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
/// Configuration options for the segmenter.
pub enum SegmenterConfig {
    /// Do not segment the data.
    #[default]
    None,
    /// Use the FastCDC algorithm with specified minimum, average, and maximum chunk sizes.
    #[serde(rename = "cdc")]
    FastCdc {
        min_size: u32,
        avg_size: u32,
        max_size: u32,
    },
    /// Use fixed-size segments.
    Fixed { size: usize },
}

impl SegmenterConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, SegmenterConfig::None)
    }
}

impl FromStr for SegmenterConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        parse_segmenter_config(s)
    }
}

/// Parse `none`, `fixed:<size>` or `cdc:<min>:<avg>:<max>`.
///
/// Sizes accept human readable units such as `64KiB`.
pub fn parse_segmenter_config(str: &str) -> anyhow::Result<SegmenterConfig> {
    let parts: Vec<&str> = str.trim().split(':').collect();
    match parts[0].to_lowercase().as_str() {
        "" | "none" => Ok(SegmenterConfig::None),
        "cdc" | "fastcdc" => {
            if parts.len() != 4 {
                return Err(anyhow::anyhow!(
                    "Invalid FastCDC segmenter config. Expected format: cdc:min_size:avg_size:max_size"
                ));
            }
            let min_size = parse_size::parse_size(parts[1])?;
            let avg_size = parse_size::parse_size(parts[2])?;
            let max_size = parse_size::parse_size(parts[3])?;
            if min_size == 0 || avg_size == 0 || max_size == 0 {
                return Err(anyhow::anyhow!(
                    "Invalid FastCDC segmenter config. Sizes must be greater than 0."
                ));
            }
            if !(min_size <= avg_size && avg_size <= max_size) {
                return Err(anyhow::anyhow!(
                    "Invalid FastCDC segmenter config. Expected min_size <= avg_size <= max_size."
                ));
            }
            let to_u32 = |v: u64| {
                u32::try_from(v).map_err(|_| anyhow::anyhow!("FastCDC size {} is too large", v))
            };
            Ok(SegmenterConfig::FastCdc {
                min_size: to_u32(min_size)?,
                avg_size: to_u32(avg_size)?,
                max_size: to_u32(max_size)?,
            })
        }
        "fixed" => {
            if parts.len() != 2 {
                return Err(anyhow::anyhow!(
                    "Invalid Fixed segmenter config. Expected format: fixed:size"
                ));
            }
            let size = parse_size::parse_size(parts[1])?;
            if size == 0 {
                return Err(anyhow::anyhow!(
                    "Invalid Fixed segmenter config. Size must be greater than 0."
                ));
            }
            Ok(SegmenterConfig::Fixed {
                size: usize::try_from(size)?,
            })
        }
        _ => Err(anyhow::anyhow!("Unknown segmenter type: {}", parts[0])),
    }
}

/// A trait for strategies that split a byte slice into one or more segments.
///
/// The yielded slices are contiguous, in order, and cover the whole input.
pub trait Segmenter {
    fn segment<'a>(&self, data: &'a [u8]) -> Box<dyn Iterator<Item = &'a [u8]> + 'a>;
}

#[cfg(feature = "cdc")]
pub struct FastCdcSegmenter {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

#[cfg(feature = "cdc")]
impl FastCdcSegmenter {
    /// Fails instead of panicking when the sizes are outside what FastCDC accepts.
    pub fn new(min_size: u32, avg_size: u32, max_size: u32) -> Result<Self> {
        use fastcdc::v2020::{
            AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
        };
        let check = |name: &str, value: u32, lo: u32, hi: u32| {
            if value < lo || value > hi {
                Err(Xp3Error::Segmenter(format!(
                    "FastCDC {} {} is outside {}..={}",
                    name, value, lo, hi
                )))
            } else {
                Ok(())
            }
        };
        check("min_size", min_size, MINIMUM_MIN, MINIMUM_MAX)?;
        check("avg_size", avg_size, AVERAGE_MIN, AVERAGE_MAX)?;
        check("max_size", max_size, MAXIMUM_MIN, MAXIMUM_MAX)?;
        Ok(Self {
            min_size,
            avg_size,
            max_size,
        })
    }
}

#[cfg(feature = "cdc")]
impl Segmenter for FastCdcSegmenter {
    fn segment<'a>(&self, data: &'a [u8]) -> Box<dyn Iterator<Item = &'a [u8]> + 'a> {
        let cdc = fastcdc::v2020::FastCDC::new(data, self.min_size, self.avg_size, self.max_size);
        Box::new(cdc.map(move |chunk| &data[chunk.offset..chunk.offset + chunk.length]))
    }
}

pub struct FixedSizeSegmenter {
    size: usize,
}

impl Segmenter for FixedSizeSegmenter {
    fn segment<'a>(&self, data: &'a [u8]) -> Box<dyn Iterator<Item = &'a [u8]> + 'a> {
        Box::new(data.chunks(self.size))
    }
}

/// Build the segmenter for `config`. `None` means one segment per file.
pub fn create_segmenter(config: SegmenterConfig) -> Result<Option<Box<dyn Segmenter + Send + Sync>>> {
    match config {
        SegmenterConfig::None => Ok(None),
        #[cfg(feature = "cdc")]
        SegmenterConfig::FastCdc {
            min_size,
            avg_size,
            max_size,
        } => Ok(Some(Box::new(FastCdcSegmenter::new(
            min_size, avg_size, max_size,
        )?))),
        #[cfg(not(feature = "cdc"))]
        SegmenterConfig::FastCdc { .. } => Err(Xp3Error::Segmenter(
            "FastCDC segmentation requires the \"cdc\" feature".into(),
        )),
        SegmenterConfig::Fixed { size: 0 } => {
            Err(Xp3Error::Segmenter("fixed segment size must be greater than 0".into()))
        }
        SegmenterConfig::Fixed { size } => Ok(Some(Box::new(FixedSizeSegmenter { size }))),
    }
}
