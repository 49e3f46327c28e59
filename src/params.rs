// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Encoder configuration and the fixed-field SPS/PPS syntax this profile
//! always emits.
//!
//! None of the values below are guesses: they are the exact fixed fields
//! the reference hardware's baseline/main-profile pipeline always sets
//! (profile 100, 4:2:0, a single reference frame, `pic_order_cnt_type = 2`),
//! plus the handful that vary with the caller's picture size.

use crate::bitstream::BitstreamBuffer;
use crate::nal_unit::NalUnitType;
use crate::{Error, Result};

/// Pixel format of the raw frames handed to the hardware's output side.
///
/// Named only — colour-space conversion into either of these layouts is a
/// frame-source concern external to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar 4:2:0 (I420/YUV420M).
    Yuv420Planar,
    /// Semi-planar 4:2:0 (NV12M).
    Nv12,
}

/// Slice type for a coded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    Idr,
    P,
}

/// Validated encoder configuration.
///
/// Constructed once through [`EncoderSetup::new`], which rejects every
/// combination the hardware cannot be configured with. `width_mbs` and
/// `height_mbs` are derived, not supplied, matching the reference driver's
/// `(width + 15) / 16` rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSetup {
    pub width: u32,
    pub width_mbs: u32,
    pub height: u32,
    pub height_mbs: u32,
    pub format: PixelFormat,
    pub fps_num: u32,
    pub fps_den: u32,
    pub bitrate: u64,
    pub gop_size: u32,
    pub qp_intra_delta: u32,
    pub qp_min: u32,
    pub qp_max: u32,
}

impl EncoderSetup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        fps_num: u32,
        fps_den: u32,
        bitrate: u64,
        gop_size: u32,
        qp_intra_delta: u32,
        qp_min: u32,
        qp_max: u32,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument("width and height must be non-zero"));
        }
        if fps_num == 0 || fps_den == 0 {
            return Err(Error::InvalidArgument("fps_num and fps_den must be non-zero"));
        }
        if bitrate == 0 {
            return Err(Error::InvalidArgument("bitrate must be non-zero"));
        }
        if gop_size == 0 {
            return Err(Error::InvalidArgument("gop_size must be non-zero"));
        }
        if qp_min > qp_max {
            return Err(Error::InvalidArgument("qp_min must be <= qp_max"));
        }

        Ok(Self {
            width,
            width_mbs: (width + 15) / 16,
            height,
            height_mbs: (height + 15) / 16,
            format,
            fps_num,
            fps_den,
            bitrate,
            gop_size,
            qp_intra_delta,
            qp_min,
            qp_max,
        })
    }

    pub fn macroblocks(&self) -> u32 {
        self.width_mbs * self.height_mbs
    }
}

/// The sequence parameter set this profile always emits, derived from
/// [`EncoderSetup`]'s picture size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sps {
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_cropping: Option<FrameCropping>,
}

/// Cropping rectangle emitted only when the picture size is not a multiple
/// of the macroblock grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCropping {
    pub crop_right: u32,
    pub crop_bottom: u32,
}

impl Sps {
    pub fn new(setup: &EncoderSetup) -> Self {
        let frame_cropping = if setup.width_mbs * 16 != setup.width || setup.height_mbs * 16 != setup.height {
            Some(FrameCropping {
                crop_right: ((setup.width_mbs * 16) - setup.width) >> 1,
                crop_bottom: ((setup.height_mbs * 16) - setup.height) >> 1,
            })
        } else {
            None
        };

        Self {
            pic_width_in_mbs_minus1: setup.width_mbs - 1,
            pic_height_in_map_units_minus1: setup.height_mbs - 1,
            frame_cropping,
        }
    }

    /// Write the NAL header and SPS RBSP into `bitstream`, stop bit
    /// included. `bitstream` is reset first.
    pub fn to_rbsp(&self, bitstream: &mut BitstreamBuffer) -> Result<()> {
        bitstream.reset();

        // NALU header: forbidden_zero_bit, nal_ref_idc, nal_unit_type.
        bitstream.append_bits(0, 1)?;
        bitstream.append_bits(3, 2)?;
        bitstream.append_bits(NalUnitType::SequenceParameterSet.value(), 5)?;

        bitstream.append_bits(100, 8)?; // profile_idc
        bitstream.append_bits(1, 1)?; // constraint_set0_flag
        bitstream.append_bits(1, 1)?; // constraint_set1_flag
        bitstream.append_bits(0, 1)?; // constraint_set2_flag
        bitstream.append_bits(0, 5)?; // constraint_setn_flag + reserved_zero_2bits
        bitstream.append_bits(31, 8)?; // level_idc
        bitstream.append_ue(0)?; // seq_parameter_set_id

        // profile_idc == 100 branch (always taken for this profile).
        bitstream.append_ue(1)?; // chroma_format_idc (4:2:0)
        bitstream.append_ue(0)?; // bit_depth_luma_minus8
        bitstream.append_ue(0)?; // bit_depth_chroma_minus8
        bitstream.append_bits(0, 1)?; // qpprime_y_zero_transform_bypass_flag
        bitstream.append_bits(0, 1)?; // seq_scaling_matrix_present_flag

        bitstream.append_ue(12)?; // log2_max_frame_num_minus4
        bitstream.append_ue(2)?; // pic_order_cnt_type (2: no explicit POC signaling)

        bitstream.append_ue(1)?; // max_num_ref_frames
        bitstream.append_bits(0, 1)?; // gaps_in_frame_num_value_allowed_flag
        bitstream.append_ue(self.pic_width_in_mbs_minus1)?;
        bitstream.append_ue(self.pic_height_in_map_units_minus1)?;
        bitstream.append_bits(1, 1)?; // frame_mbs_only_flag
        bitstream.append_bits(1, 1)?; // direct_8x8_inference_flag

        match self.frame_cropping {
            Some(crop) => {
                bitstream.append_bits(1, 1)?; // frame_cropping_flag
                bitstream.append_ue(0)?; // frame_crop_left_offset
                bitstream.append_ue(crop.crop_right)?;
                bitstream.append_ue(0)?; // frame_crop_top_offset
                bitstream.append_ue(crop.crop_bottom)?;
            }
            None => {
                bitstream.append_bits(0, 1)?; // frame_cropping_flag
            }
        }

        bitstream.append_bits(0, 1)?; // vui_parameters_present_flag
        bitstream.append_bits(1, 1)?; // rbsp_stop_one_bit
        Ok(())
    }
}

/// The picture parameter set this profile always emits; it carries no
/// per-session state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pps;

impl Pps {
    pub fn new() -> Self {
        Self
    }

    /// Write the NAL header and PPS RBSP into `bitstream`, stop bit
    /// included. `bitstream` is reset first.
    pub fn to_rbsp(&self, bitstream: &mut BitstreamBuffer) -> Result<()> {
        bitstream.reset();

        bitstream.append_bits(0, 1)?; // forbidden_zero_bit
        bitstream.append_bits(3, 2)?; // nal_ref_idc
        bitstream.append_bits(NalUnitType::PictureParameterSet.value(), 5)?;

        bitstream.append_ue(0)?; // pic_parameter_set_id
        bitstream.append_ue(0)?; // seq_parameter_set_id
        bitstream.append_bits(1, 1)?; // entropy_coding_mode_flag (CABAC)
        bitstream.append_bits(0, 1)?; // bottom_field_pic_order_in_frame_present_flag
        bitstream.append_ue(0)?; // num_slice_groups_minus1
        bitstream.append_ue(0)?; // num_ref_idx_l0_default_active_minus1
        bitstream.append_ue(0)?; // num_ref_idx_l1_default_active_minus1
        bitstream.append_bits(0, 1)?; // weighted_pred_flag
        bitstream.append_bits(0, 2)?; // weighted_bipred_idc
        bitstream.append_se(20 - 26)?; // pic_init_qp_minus26
        bitstream.append_se(0)?; // pic_init_qs_minus26
        bitstream.append_se(4)?; // chroma_qp_index_offset
        bitstream.append_bits(1, 1)?; // deblocking_filter_control_present_flag
        bitstream.append_bits(0, 1)?; // constrained_intra_pred_flag
        bitstream.append_bits(0, 1)?; // redundant_pic_cnt_present_flag

        bitstream.append_bits(1, 1)?; // rbsp_stop_one_bit
        Ok(())
    }
}
