//! Weight encoding.
//!
//! Weights are re-laid out into one stream per weight stripe (an output-channel
//! slice crossed with an input-channel slice), each prefixed, for its first
//! input slice, by the per-output-channel bias and requantization parameters.
//! Streams are padded so that each starts on a bank-aligned boundary, and the
//! metadata table records where each one starts.

use dashmap::DashMap;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::common::{QuantizationInfo, TensorShape};
use crate::graph::MceOperation;
use crate::utils::{calculate_rescale_multiplier_and_shift, div_round_up, round_up_to_multiple};

const STREAM_ALIGNMENT: u32 = 16;
const BYTES_PER_CHANNEL_HEADER: usize = 8;

/// Raw weights and bias for a convolution-like operation.
///
/// `weights_shape` is `[kh, kw, ic, oc]` (HWIO), or `[kh, kw, c, 1]` (HWIM)
/// for depthwise convolution.
#[derive(Clone, Debug)]
pub struct ConvData {
    pub weights_shape: TensorShape,
    pub weights: Arc<Vec<u8>>,
    pub weights_quantization: QuantizationInfo,
    pub bias: Arc<Vec<i32>>,
    digest: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct WeightsMetadata {
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedWeights {
    pub data: Vec<u8>,
    pub metadata: Vec<WeightsMetadata>,
    pub max_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct EncodingKey {
    digest: u64,
    operation: MceOperation,
    stripe_depth: u32,
    iteration_size: u32,
    input_scale: u32,
    output_scale: u32,
}

/// Encodes weights, remembering previous results.
///
/// The cache is keyed by the content of the weights and the encoding
/// parameters, so it may be shared freely between threads and parts.
#[derive(Debug, Default)]
pub struct WeightEncoder {
    cache: DashMap<EncodingKey, Arc<EncodedWeights>>,
}

impl ConvData {
    pub fn new(
        weights_shape: TensorShape,
        weights: Vec<u8>,
        weights_quantization: QuantizationInfo,
        bias: Vec<i32>,
    ) -> Self {
        assert_eq!(
            weights.len() as u64,
            crate::common::num_elements(&weights_shape)
        );
        let mut hasher = DefaultHasher::new();
        weights_shape.hash(&mut hasher);
        weights.hash(&mut hasher);
        bias.hash(&mut hasher);
        weights_quantization.zero_point.hash(&mut hasher);
        weights_quantization.scale.to_bits().hash(&mut hasher);
        if let Some(scales) = &weights_quantization.per_channel_scales {
            for s in scales {
                s.to_bits().hash(&mut hasher);
            }
        }
        ConvData {
            weights_shape,
            weights: Arc::new(weights),
            weights_quantization,
            bias: Arc::new(bias),
            digest: hasher.finish(),
        }
    }

    /// 1×1 depthwise weights which, at a weight scale of ½ and a weight of 2,
    /// reproduce their input.
    pub fn identity_depthwise(channels: u32) -> Self {
        ConvData::new(
            [1, 1, channels, 1],
            vec![2; channels as usize],
            QuantizationInfo::new(0, 0.5),
            vec![0; channels as usize],
        )
    }

    pub fn kernel_height(&self) -> u32 {
        self.weights_shape[0]
    }

    pub fn kernel_width(&self) -> u32 {
        self.weights_shape[1]
    }

    fn weight_scale(&self, channel: usize) -> f32 {
        match &self.weights_quantization.per_channel_scales {
            Some(scales) => scales[channel],
            None => self.weights_quantization.scale,
        }
    }
}

impl EncodedWeights {
    /// The metadata table as stored in DRAM: little-endian (offset, size)
    /// pairs.
    pub fn metadata_bytes(&self) -> Vec<u8> {
        self.metadata
            .iter()
            .flat_map(|m| m.offset.to_le_bytes().into_iter().chain(m.size.to_le_bytes()))
            .collect()
    }
}

impl WeightEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `conv` into stripes of `stripe_depth` output channels by
    /// `iteration_size` input channels.
    pub fn encode(
        &self,
        conv: &ConvData,
        operation: MceOperation,
        input_quantization: &QuantizationInfo,
        output_quantization: &QuantizationInfo,
        stripe_depth: u32,
        iteration_size: u32,
    ) -> Arc<EncodedWeights> {
        let key = EncodingKey {
            digest: conv.digest,
            operation,
            stripe_depth,
            iteration_size,
            input_scale: input_quantization.scale.to_bits(),
            output_scale: output_quantization.scale.to_bits(),
        };
        if let Some(hit) = self.cache.get(&key) {
            return Arc::clone(hit.value());
        }
        let encoded = Arc::new(encode_weights(
            conv,
            operation,
            input_quantization.scale,
            output_quantization.scale,
            stripe_depth,
            iteration_size,
        ));
        debug!(
            "Encoded {} weight stripes ({} bytes)",
            encoded.metadata.len(),
            encoded.data.len()
        );
        Arc::clone(self.cache.entry(key).or_insert(encoded).value())
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

fn encode_weights(
    conv: &ConvData,
    operation: MceOperation,
    input_scale: f32,
    output_scale: f32,
    stripe_depth: u32,
    iteration_size: u32,
) -> EncodedWeights {
    let [kh, kw, ic, oc] = conv.weights_shape;
    let depthwise = operation == MceOperation::DepthwiseConvolution;
    let num_output_channels = if depthwise { ic } else { oc };
    let num_ofm_stripes = div_round_up(num_output_channels, stripe_depth.max(1));
    let num_ifm_stripes = if depthwise {
        1
    } else {
        div_round_up(ic, iteration_size.max(1))
    };

    let streams: Vec<Vec<u8>> = (0..num_ofm_stripes * num_ifm_stripes)
        .into_par_iter()
        .map(|idx| {
            let ofm_stripe = idx / num_ifm_stripes;
            let ifm_stripe = idx % num_ifm_stripes;
            let ofm_begin = ofm_stripe * stripe_depth;
            let ofm_end = (ofm_begin + stripe_depth).min(num_output_channels);
            let mut stream = Vec::new();
            if ifm_stripe == 0 {
                for o in ofm_begin..ofm_end {
                    let scale = f64::from(input_scale) * f64::from(conv.weight_scale(o as usize))
                        / f64::from(output_scale);
                    let (multiplier, shift) = calculate_rescale_multiplier_and_shift(scale);
                    stream.extend_from_slice(&conv.bias[o as usize].to_le_bytes());
                    stream.extend_from_slice(&multiplier.to_le_bytes());
                    stream.push(shift as u8);
                    stream.push(0);
                }
                debug_assert_eq!(
                    stream.len(),
                    (ofm_end - ofm_begin) as usize * BYTES_PER_CHANNEL_HEADER
                );
            }
            let (ifm_begin, ifm_end) = if depthwise {
                (ofm_begin, ofm_end)
            } else {
                let begin = ifm_stripe * iteration_size;
                (begin, (begin + iteration_size).min(ic))
            };
            for o in ofm_begin..ofm_end {
                for i in ifm_begin..ifm_end {
                    if depthwise && i != o {
                        continue;
                    }
                    for y in 0..kh {
                        for x in 0..kw {
                            let index = if depthwise {
                                (y * kw + x) * ic + i
                            } else {
                                ((y * kw + x) * ic + i) * oc + o
                            };
                            stream.push(conv.weights[index as usize]);
                        }
                    }
                }
            }
            let padded = round_up_to_multiple(stream.len() as u32, STREAM_ALIGNMENT);
            stream.resize(padded as usize, 0);
            stream
        })
        .collect();

    let mut data = Vec::with_capacity(streams.iter().map(Vec::len).sum());
    let mut metadata = Vec::with_capacity(streams.len());
    for stream in streams {
        metadata.push(WeightsMetadata {
            offset: data.len() as u32,
            size: stream.len() as u32,
        });
        data.extend(stream);
    }
    let max_size = metadata.iter().map(|m| m.size).max().unwrap_or(0);
    EncodedWeights {
        data,
        metadata,
        max_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_3x3(ic: u32, oc: u32) -> ConvData {
        let len = (9 * ic * oc) as usize;
        ConvData::new(
            [3, 3, ic, oc],
            (0..len).map(|i| i as u8).collect(),
            QuantizationInfo::new(0, 0.5),
            vec![7; oc as usize],
        )
    }

    #[test]
    fn test_streams_are_contiguous_and_aligned() {
        let encoder = WeightEncoder::new();
        let q = QuantizationInfo::default();
        let encoded = encoder.encode(
            &conv_3x3(32, 40),
            MceOperation::Convolution,
            &q,
            &q,
            16,
            16,
        );
        // 3 output slices by 2 input slices.
        assert_eq!(encoded.metadata.len(), 6);
        let mut expected_offset = 0;
        for m in &encoded.metadata {
            assert_eq!(m.offset, expected_offset);
            assert_eq!(m.size % STREAM_ALIGNMENT, 0);
            expected_offset += m.size;
        }
        assert_eq!(expected_offset as usize, encoded.data.len());
        assert_eq!(
            encoded.max_size,
            encoded.metadata.iter().map(|m| m.size).max().unwrap()
        );
        assert_eq!(encoded.metadata_bytes().len(), 6 * 8);
    }

    #[test]
    fn test_cache_returns_shared_result() {
        let encoder = WeightEncoder::new();
        let q = QuantizationInfo::default();
        let conv = conv_3x3(16, 16);
        let a = encoder.encode(&conv, MceOperation::Convolution, &q, &q, 16, 16);
        let b = encoder.encode(&conv.clone(), MceOperation::Convolution, &q, &q, 16, 16);
        assert!(Arc::ptr_eq(&a, &b));
        let c = encoder.encode(&conv, MceOperation::Convolution, &q, &q, 8, 16);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(encoder.cached_entries(), 2);
    }

    #[test]
    fn test_identity_depthwise_has_identity_rescale() {
        let encoder = WeightEncoder::new();
        let q = QuantizationInfo::new(0, 0.25);
        let conv = ConvData::identity_depthwise(16);
        let encoded = encoder.encode(&conv, MceOperation::DepthwiseConvolution, &q, &q, 16, 16);
        // Scale is 0.25 * 0.5 / 0.25 = 0.5.
        let header = &encoded.data[4..7];
        let multiplier = u16::from_le_bytes([header[0], header[1]]);
        assert_eq!((multiplier, header[2]), (32768, 16));
    }
}
