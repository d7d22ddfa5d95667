//! Reconstruction recipes
//!
//! Every recipe runs the same backbone once per (mix, stack) iteration:
//!
//! ```text
//! read -> (compress) -> (regrid) -> (EPI correction) -> assemble
//!      -> (fill holes) -> filter -> FFT -> (SENSE) -> shift -> homodyne
//!      -> coil combine -> crop -> geometry -> in-plane format
//! ```
//!
//! and adds its own stages around it. Iterations share no state: each one
//! builds its own selection criteria and k-space volume, so they may run on
//! the rayon pool when [`ReconConfig::parallel`] is set.

use rayon::prelude::*;
use std::path::{Path, PathBuf};

use crate::assembly::{assemble, AssemblyOptions, PhaseEncodeSource};
use crate::cardiac::{retro_binning, retro_fill_holes};
use crate::compression::CompressionMatrix;
use crate::config::ReconConfig;
use crate::epi::{correct_epi_profiles, epi_correction_data, regrid_readout, EpiCorrection};
use crate::error::{ReconError, Result};
use crate::export::{output_name, ReconOutputs};
use crate::fft::{shift_image, FftWorkspace};
use crate::filter::ringing_filter;
use crate::flow::{check_flow_scan, concomitant_field_correction, divide_flow_segments, fit_flow_phase, format_flow};
use crate::geometry::{crop_oversampling, format_in_plane, geometry_correction, zeropad_square};
use crate::homodyne::homodyne;
use crate::labels::{format_label_table, relabel_rejected, Label, LabelInventory, LabelType, RawProfile, SelectionCriteria};
use crate::params::{ScanParameters, StackEncoding};
use crate::profiling::{StageRecorder, StageTimer};
use crate::reader::SampleReader;
use crate::sense::{resolve_reference_scan, sense_unfold, ReferenceImages, SensitivityMaps};
use crate::spectro::spectro_recon;
use crate::volume::{Axis, Volume};

/// Everything a recipe needs besides the labels
#[derive(Clone, Copy)]
pub struct ReconContext<'a> {
    pub reader: &'a dyn SampleReader,
    pub params: &'a ScanParameters,
    pub config: &'a ReconConfig,
    pub recorder: &'a dyn StageRecorder,
}

impl<'a> ReconContext<'a> {
    pub fn new(
        reader: &'a dyn SampleReader,
        params: &'a ScanParameters,
        config: &'a ReconConfig,
        recorder: &'a dyn StageRecorder,
    ) -> Self {
        Self { reader, params, config, recorder }
    }

    /// SENSE regularization: config override, then scan value, then 2
    pub fn regularization(&self) -> f64 {
        self.config.regularization.unwrap_or_else(|| self.params.regularization())
    }

    fn readout_oversampled(&self) -> bool {
        self.config.remove_readout_oversampling
    }

    /// Run `f` for every (mix, stack) and merge the outputs
    ///
    /// The first failing iteration aborts the recipe.
    fn for_each_iteration<F>(&self, iterations: &[(u16, u16)], f: F) -> Result<ReconOutputs>
    where
        F: Fn(u16, u16) -> Result<ReconOutputs> + Sync,
    {
        let parts: Vec<ReconOutputs> = if self.config.parallel {
            iterations.par_iter().map(|&(mix, stack)| f(mix, stack)).collect::<Result<_>>()?
        } else {
            iterations.iter().map(|&(mix, stack)| f(mix, stack)).collect::<Result<_>>()?
        };
        let mut out = ReconOutputs::new();
        for part in parts {
            out.merge(part);
        }
        Ok(out)
    }
}

// ============================================================================
// Backbone
// ============================================================================

/// Sensitivities of one iteration plus the channel ids they belong to
struct UnfoldSetup {
    maps: SensitivityMaps,
    channel_ids: Vec<i64>,
}

/// Optional stages of one backbone run
struct IterationPlan<'p> {
    enc: &'p StackEncoding,
    segment: Option<u16>,
    compression: Option<&'p CompressionMatrix>,
    sense: Option<&'p UnfoldSetup>,
    cardiac_phases: Option<usize>,
    epi: bool,
}

impl<'p> IterationPlan<'p> {
    fn new(enc: &'p StackEncoding) -> Self {
        Self { enc, segment: None, compression: None, sense: None, cardiac_phases: None, epi: false }
    }
}

/// Image-space result of one backbone run, before coil combination
struct IterationImage {
    image: Volume,
    locations: Vec<u16>,
}

fn read_profiles(
    ctx: &ReconContext,
    criteria: &SelectionCriteria,
    labels: &[Label],
    plan: &IterationPlan,
    range: [i32; 2],
) -> Result<Vec<RawProfile>> {
    let mut profiles = {
        let _t = StageTimer::new(ctx.recorder, "read");
        ctx.reader.read(criteria, labels)?
    };
    if let Some(matrix) = plan.compression {
        let _t = StageTimer::new(ctx.recorder, "compress");
        profiles = matrix.compress_profiles(&profiles)?;
    }
    if plan.epi && !ctx.params.nus_positions.is_empty() {
        let _t = StageTimer::new(ctx.recorder, "regrid");
        profiles = regrid_readout(&profiles, &ctx.params.nus_positions, range)?;
    }
    Ok(profiles)
}

fn assembly_options(ctx: &ReconContext, size: [usize; 3], readout_range: [i32; 2], n_samples: usize) -> AssemblyOptions {
    let options = AssemblyOptions::new(size)
        .with_averaging(ctx.config.averaging)
        .with_bounds(ctx.config.bounds);
    if (readout_range[1] - readout_range[0] + 1) as usize == n_samples {
        options.with_readout_range(readout_range)
    } else {
        options
    }
}

/// Per-echo phase models of the EPI calibration acquisition
///
/// Returns `None` when the scan has no calibration echoes.
fn epi_calibration(
    ctx: &ReconContext,
    labels: &[Label],
    criteria: &SelectionCriteria,
    plan: &IterationPlan,
    size: [usize; 3],
    range: [i32; 2],
) -> Result<Option<EpiCorrection>> {
    let calibration = criteria.with_type(LabelType::EchoPhase);
    let profiles = match read_profiles(ctx, &calibration, labels, plan, range) {
        Ok(p) => p,
        Err(ReconError::NoData(_)) => {
            log::warn!("no EPI calibration echoes, ghost correction skipped");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let _t = StageTimer::new(ctx.recorder, "epi_calibration");
    let n_samples = profiles.first().map_or(0, |p| p.samples.len());
    let options = assembly_options(ctx, size, range, n_samples)
        .with_zero_fill([true, false, false])
        .with_phase_source(PhaseEncodeSource::Grad);
    let mut kspace = assemble(&profiles, &options)?;
    FftWorkspace::new().k2i(&mut kspace.data, &[Axis::Readout]);
    kspace.data = shift_image(&kspace.data, &[(Axis::Readout, plan.enc.shifts[0])]);
    Ok(Some(epi_correction_data(&kspace)?))
}

/// Read, assemble and transform one iteration
fn reconstruct_image(
    ctx: &ReconContext,
    labels: &[Label],
    mix: u16,
    stack: u16,
    plan: &IterationPlan,
) -> Result<IterationImage> {
    let enc = plan.enc;
    let ro_os = ctx.readout_oversampled();
    let base = SelectionCriteria::for_iteration(mix, stack);
    let criteria = match plan.segment {
        Some(segment) => base.with_flow_segment(segment),
        None => base.clone(),
    };

    let full = enc.recon_resolution([ro_os, true, true], false);
    let size = enc.recon_resolution([ro_os, true, true], plan.sense.is_some());
    let ranges = enc.ranges(ro_os);

    let mut profiles = read_profiles(ctx, &criteria, labels, plan, ranges[0])?;
    let n_samples = profiles.first().map_or(0, |p| p.samples.len());
    let mut options = assembly_options(ctx, size, ranges[0], n_samples);
    if let Some(phases) = plan.cardiac_phases {
        options = options.with_fixed_extent(Axis::CardiacPhase, phases);
    }

    if plan.epi {
        if let Some(correction) = epi_calibration(ctx, labels, &base, plan, size, ranges[0])? {
            let _t = StageTimer::new(ctx.recorder, "epi_correction");
            profiles = correct_epi_profiles(&profiles, &correction, &options, enc.shifts[0])?;
            options.readout_range = None;
        }
    }

    let mut kspace = {
        let _t = StageTimer::new(ctx.recorder, "assemble");
        assemble(&profiles, &options)?
    };
    if plan.cardiac_phases.is_some() {
        let _t = StageTimer::new(ctx.recorder, "fill_holes");
        retro_fill_holes(&mut kspace);
    }
    if ctx.config.apply_ringing_filter {
        let _t = StageTimer::new(ctx.recorder, "filter");
        ringing_filter(&mut kspace.data, ctx.config.filter_edges, ranges);
    }

    let locations: Vec<u16> = kspace.values(Axis::Location).iter().map(|&l| l as u16).collect();
    let channels = kspace.values(Axis::Channel).to_vec();
    let mut fft = FftWorkspace::new();
    let mut image = {
        let _t = StageTimer::new(ctx.recorder, "fft");
        let mut data = kspace.data;
        fft.k2i(&mut data, &Axis::SPATIAL);
        shift_image(&data, &[(Axis::Readout, enc.shifts[0])])
    };

    let mut homodyne_ranges = ranges;
    if let Some(setup) = plan.sense {
        let _t = StageTimer::new(ctx.recorder, "sense");
        if channels != setup.channel_ids {
            return Err(ReconError::ShapeMismatch(format!(
                "data channels {:?} do not match the reference channels {:?}",
                channels, setup.channel_ids
            )));
        }
        image = sense_unfold(&image, &setup.maps.sensitivity, &setup.maps.psi, full, ctx.regularization())?;
        for enc_axis in 1..3 {
            let factor = full[enc_axis] as f64 / size[enc_axis] as f64;
            let r = ranges[enc_axis];
            homodyne_ranges[enc_axis] = [
                (r[0] as f64 * factor).round() as i32,
                ((r[1] + 1) as f64 * factor).round() as i32 - 1,
            ];
        }
    }
    image = shift_image(&image, &[(Axis::PhaseEncode, enc.shifts[1]), (Axis::Partition, enc.shifts[2])]);

    {
        let _t = StageTimer::new(ctx.recorder, "homodyne");
        image = homodyne(&image, homodyne_ranges);
    }
    Ok(IterationImage { image, locations })
}

/// Crop the oversampled field of view
fn crop_to_fov(ctx: &ReconContext, enc: &StackEncoding, image: &Volume) -> Volume {
    let readout = if ctx.readout_oversampled() { enc.oversampling[0] } else { 1.0 };
    crop_oversampling(
        image,
        &[
            (Axis::Readout, readout),
            (Axis::PhaseEncode, enc.oversampling[1]),
            (Axis::Partition, enc.oversampling[2]),
        ],
    )
}

/// Geometry correction and display orientation
fn orient(ctx: &ReconContext, enc: &StackEncoding, image: &Volume, locations: &[u16]) -> Result<Volume> {
    let mut out = match &ctx.params.gradient_nonlinearity {
        Some(nonlinearity) => {
            let _t = StageTimer::new(ctx.recorder, "geometry");
            let transforms = ctx.params.transforms(locations)?;
            geometry_correction(image, locations, &transforms, Some(nonlinearity), enc.voxel_sizes)?
        }
        None => image.clone(),
    };
    out = format_in_plane(&out, enc.in_plane);
    if ctx.config.square_pad {
        out = zeropad_square(&out);
    }
    Ok(out)
}

/// Voxel sizes of the oriented output
fn output_voxels(enc: &StackEncoding) -> [f64; 3] {
    let [vx, vy, vz] = enc.voxel_sizes;
    if enc.in_plane.transpose {
        [vy, vx, vz]
    } else {
        [vx, vy, vz]
    }
}

/// Coil combination, cropping and orientation of a backbone result
fn finish(ctx: &ReconContext, enc: &StackEncoding, result: &IterationImage) -> Result<Volume> {
    let combined = if result.image.len(Axis::Channel) > 1 {
        result.image.sum_of_squares(Axis::Channel)
    } else {
        result.image.clone()
    };
    orient(ctx, enc, &crop_to_fov(ctx, enc, &combined), &result.locations)
}

// ============================================================================
// SENSE setup
// ============================================================================

/// Locate the reference scan named in the scan parameters
pub fn locate_reference_scan(folder: &Path, params: &ScanParameters) -> Result<PathBuf> {
    let name = params
        .reference_scan
        .as_deref()
        .ok_or_else(|| ReconError::MissingParameter("reference scan file name".to_string()))?;
    resolve_reference_scan(folder, name)
}

/// Compression matrix of the reference coil array, if enabled
fn compression_matrix(ctx: &ReconContext, reference: &ReferenceImages) -> Result<Option<CompressionMatrix>> {
    if !ctx.config.compress_coils {
        return Ok(None);
    }
    let k = ctx.config.virtual_coil_count(reference.channel_ids.len());
    CompressionMatrix::from_coil_images(&reference.coil, &reference.channel_ids, k).map(Some)
}

fn unfold_setup(
    ctx: &ReconContext,
    reference: &ReferenceImages,
    compression: Option<&CompressionMatrix>,
    enc: &StackEncoding,
) -> Result<UnfoldSetup> {
    let _t = StageTimer::new(ctx.recorder, "sensitivities");
    let full = enc.recon_resolution([ctx.readout_oversampled(), true, true], false);
    let maps = reference.sensitivities(full, enc.voxel_sizes, ctx.config.body_threshold)?;
    Ok(match compression {
        Some(matrix) => UnfoldSetup {
            maps: maps.compress(matrix)?,
            channel_ids: (0..matrix.virtual_coils() as i64).collect(),
        },
        None => UnfoldSetup {
            maps,
            channel_ids: reference.channel_ids.iter().map(|&c| c as i64).collect(),
        },
    })
}

fn insert_reference_outputs(
    ctx: &ReconContext,
    out: &mut ReconOutputs,
    enc: &StackEncoding,
    setup: &UnfoldSetup,
    mix: u16,
    stack: u16,
) {
    let voxels = output_voxels(enc);
    let maps = &setup.maps;
    for (kind, volume) in [("sensitivity", &maps.sensitivity), ("coil_ref", &maps.coil), ("body_ref", &maps.body)] {
        let formatted = format_in_plane(&crop_to_fov(ctx, enc, volume), enc.in_plane);
        out.insert(output_name(kind, mix, stack), formatted, voxels);
    }
}

// ============================================================================
// Recipes
// ============================================================================

/// Log the label table and return it
pub fn print_labels(labels: &[Label]) -> String {
    let table = format_label_table(labels);
    log::info!("{} labels\n{}", labels.len(), table);
    table
}

/// Central k-space profiles (ky = kz = 0) of one iteration
///
/// Rejected profiles are turned into normal ones first, so repeated
/// acquisitions of the center are included.
pub fn read_k0(ctx: &ReconContext, labels: &[Label], mix: u16, stack: u16) -> Result<Volume> {
    let relabeled = relabel_rejected(labels);
    let criteria = SelectionCriteria::for_iteration(mix, stack).with_ky(0).with_kz(0);
    let profiles = ctx.reader.read(&criteria, &relabeled)?;
    let options = AssemblyOptions::new([1, 1, 1])
        .with_zero_fill([false; 3])
        .with_averaging(ctx.config.averaging)
        .with_bounds(ctx.config.bounds);
    Ok(assemble(&profiles, &options)?.data)
}

/// Fully sampled Cartesian scan, sum-of-squares coil combination
pub fn recon_cartesian(ctx: &ReconContext, labels: &[Label]) -> Result<ReconOutputs> {
    let inventory = LabelInventory::from_labels(labels);
    log::info!("cartesian recon of {} iterations", inventory.iterations().len());
    ctx.for_each_iteration(&inventory.iterations(), |mix, stack| {
        let enc = ctx.params.encoding(mix, stack)?;
        let result = reconstruct_image(ctx, labels, mix, stack, &IterationPlan::new(enc))?;
        let mut out = ReconOutputs::new();
        out.insert(output_name("data", mix, stack), finish(ctx, enc, &result)?, output_voxels(enc));
        Ok(out)
    })
}

/// SENSE scan unfolded with the sensitivities of `reference`
pub fn recon_sense(ctx: &ReconContext, labels: &[Label], reference: &ReferenceImages) -> Result<ReconOutputs> {
    let inventory = LabelInventory::from_labels(labels);
    let compression = compression_matrix(ctx, reference)?;
    log::info!(
        "SENSE recon of {} iterations, lambda = {}",
        inventory.iterations().len(),
        ctx.regularization()
    );
    ctx.for_each_iteration(&inventory.iterations(), |mix, stack| {
        let enc = ctx.params.encoding(mix, stack)?;
        let setup = unfold_setup(ctx, reference, compression.as_ref(), enc)?;
        let plan = IterationPlan { compression: compression.as_ref(), sense: Some(&setup), ..IterationPlan::new(enc) };
        let result = reconstruct_image(ctx, labels, mix, stack, &plan)?;

        let mut out = ReconOutputs::new();
        out.insert(output_name("data", mix, stack), finish(ctx, enc, &result)?, output_voxels(enc));
        insert_reference_outputs(ctx, &mut out, enc, &setup, mix, stack);
        Ok(out)
    })
}

/// EPI scan: ramp regridding and ghost correction, SENSE when a reference is given
pub fn recon_epi(ctx: &ReconContext, labels: &[Label], reference: Option<&ReferenceImages>) -> Result<ReconOutputs> {
    if !ctx.params.is_epi() {
        return Err(ReconError::InputClassification("this is not an EPI scan".to_string()));
    }
    let inventory = LabelInventory::from_labels(labels);
    let compression = match reference {
        Some(r) => compression_matrix(ctx, r)?,
        None => None,
    };
    ctx.for_each_iteration(&inventory.iterations(), |mix, stack| {
        let enc = ctx.params.encoding(mix, stack)?;
        let setup = match reference {
            Some(r) => Some(unfold_setup(ctx, r, compression.as_ref(), enc)?),
            None => None,
        };
        let plan = IterationPlan {
            compression: compression.as_ref(),
            sense: setup.as_ref(),
            epi: true,
            ..IterationPlan::new(enc)
        };
        let result = reconstruct_image(ctx, labels, mix, stack, &plan)?;

        let mut out = ReconOutputs::new();
        out.insert(output_name("data", mix, stack), finish(ctx, enc, &result)?, output_voxels(enc));
        if let Some(setup) = &setup {
            insert_reference_outputs(ctx, &mut out, enc, setup, mix, stack);
        }
        Ok(out)
    })
}

/// Retrospectively gated cardiac scan
///
/// Profiles are binned by trigger delay, empty phases are filled from
/// their neighbours before the transform.
pub fn recon_cardiac(ctx: &ReconContext, labels: &[Label], reference: Option<&ReferenceImages>) -> Result<ReconOutputs> {
    let phases = ctx
        .config
        .cardiac_phases
        .or(ctx.params.cardiac_phases)
        .ok_or_else(|| ReconError::MissingParameter("number of cardiac phases".to_string()))?;
    let binned = {
        let _t = StageTimer::new(ctx.recorder, "binning");
        retro_binning(labels, phases, ctx.params.cardiac_cycle_length)?
    };
    let inventory = LabelInventory::from_labels(&binned);
    let compression = match reference {
        Some(r) => compression_matrix(ctx, r)?,
        None => None,
    };
    ctx.for_each_iteration(&inventory.iterations(), |mix, stack| {
        let enc = ctx.params.encoding(mix, stack)?;
        let setup = match reference {
            Some(r) => Some(unfold_setup(ctx, r, compression.as_ref(), enc)?),
            None => None,
        };
        let plan = IterationPlan {
            compression: compression.as_ref(),
            sense: setup.as_ref(),
            cardiac_phases: Some(phases),
            ..IterationPlan::new(enc)
        };
        let result = reconstruct_image(ctx, &binned, mix, stack, &plan)?;

        let mut out = ReconOutputs::new();
        out.insert(output_name("data", mix, stack), finish(ctx, enc, &result)?, output_voxels(enc));
        if let Some(setup) = &setup {
            insert_reference_outputs(ctx, &mut out, enc, setup, mix, stack);
        }
        Ok(out)
    })
}

/// Phase-contrast flow scan
///
/// Segments are reconstructed with SENSE (which keeps the phase), then
/// decoded into magnitude and RL/AP/FH velocities.
pub fn recon_flow(ctx: &ReconContext, labels: &[Label], reference: &ReferenceImages) -> Result<ReconOutputs> {
    let inventory = LabelInventory::from_labels(labels);
    check_flow_scan(&inventory.flow_segments)?;
    let compression = compression_matrix(ctx, reference)?;
    log::info!("flow recon with {} segments", inventory.flow_segments.len());

    ctx.for_each_iteration(&inventory.iterations(), |mix, stack| {
        let enc = ctx.params.encoding(mix, stack)?;
        let setup = unfold_setup(ctx, reference, compression.as_ref(), enc)?;

        let mut segments = Vec::with_capacity(inventory.flow_segments.len());
        let mut locations = Vec::new();
        for &segment in &inventory.flow_segments {
            let plan = IterationPlan {
                segment: Some(segment),
                compression: compression.as_ref(),
                sense: Some(&setup),
                ..IterationPlan::new(enc)
            };
            let result = reconstruct_image(ctx, labels, mix, stack, &plan)?;
            segments.push(crop_to_fov(ctx, enc, &result.image));
            locations = result.locations;
        }
        let stacked = Volume::stack(Axis::FlowSegment, &segments)?;

        let decoded = {
            let _t = StageTimer::new(ctx.recorder, "flow");
            let corrected = if ctx.params.concomitant_factors.is_empty() {
                stacked
            } else {
                let transforms = ctx.params.transforms(&locations)?;
                concomitant_field_correction(&stacked, &transforms, &ctx.params.concomitant_factors, enc.voxel_sizes)?
            };
            let mut decoded = divide_flow_segments(&corrected, ctx.params.hadamard)?;
            if let Some(order) = ctx.config.background_order {
                decoded = fit_flow_phase(&decoded, order)?;
            }
            format_flow(&decoded, &ctx.params.flow_directions, &ctx.params.venc)?
        };

        let mut out = ReconOutputs::new();
        out.insert(output_name("data", mix, stack), orient(ctx, enc, &decoded, &locations)?, output_voxels(enc));
        insert_reference_outputs(ctx, &mut out, enc, &setup, mix, stack);
        Ok(out)
    })
}

/// Single-voxel spectroscopy
pub fn recon_spectro(ctx: &ReconContext, labels: &[Label]) -> Result<ReconOutputs> {
    let inventory = LabelInventory::from_labels(labels);
    ctx.for_each_iteration(&inventory.iterations(), |mix, stack| {
        let enc = ctx.params.encoding(mix, stack)?;
        let criteria = SelectionCriteria::for_iteration(mix, stack);
        let profiles = ctx.reader.read(&criteria, labels)?;
        let options = AssemblyOptions::new([1, 1, 1])
            .with_zero_fill([false; 3])
            .with_averaging(ctx.config.averaging)
            .with_bounds(ctx.config.bounds);
        let fid = assemble(&profiles, &options)?;

        let _t = StageTimer::new(ctx.recorder, "spectro");
        let factor = if ctx.readout_oversampled() { enc.oversampling[0] } else { 1.0 };
        let mut out = ReconOutputs::new();
        out.insert(output_name("data", mix, stack), spectro_recon(&fid.data, factor)?, enc.voxel_sizes);
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::i2k;
    use crate::profiling::{NoopRecorder, TimingLog};
    use crate::reader::InMemoryReader;
    use crate::volume::Shape;
    use num_complex::Complex64;

    /// Profiles of a single-channel 8x8 image with constant value `value`,
    /// acquired once per mix
    fn scan(value: f64, epi: bool, mixes: u16) -> (Vec<Label>, InMemoryReader, ScanParameters) {
        let mut k = Volume::from_fn(Shape::new([8, 8, 1]), |c| {
            let inside = (2..6).contains(&c[0]) && (2..6).contains(&c[1]);
            Complex64::new(if inside { value } else { 0.0 }, 0.0)
        });
        i2k(&mut k, &[Axis::Readout, Axis::PhaseEncode]);
        let mut labels = Vec::new();
        let mut samples = Vec::new();
        let mut encodings = Vec::new();
        for mix in 0..mixes {
            for j in 0..8 {
                labels.push(Label { mix, ky: j as i32 - 4, ..Label::default() });
                samples.push(k.data()[j * 8..(j + 1) * 8].to_vec());
            }
            encodings.push(StackEncoding {
                mix,
                recon_resolution: [8, 8, 1],
                ranges: [[-4, 3], [-4, 3], [0, 0]],
                ..StackEncoding::default()
            });
        }
        let params = ScanParameters { encodings, epi, ..ScanParameters::default() };
        (labels, InMemoryReader::new(samples), params)
    }

    fn plain_config() -> ReconConfig {
        ReconConfig { apply_ringing_filter: false, ..ReconConfig::default() }
    }

    #[test]
    fn test_cartesian_recovers_image() {
        let (labels, reader, params) = scan(3.0, false, 1);
        let config = plain_config();
        let ctx = ReconContext::new(&reader, &params, &config, &NoopRecorder);
        let out = recon_cartesian(&ctx, &labels).unwrap();
        assert_eq!(out.names(), vec!["data_0_0"]);
        let image = out.get("data_0_0").unwrap();
        assert!((image.data()[3 + 3 * 8].re - 3.0).abs() < 1e-9);
        assert!(image.data()[0].norm() < 1e-9);
    }

    #[test]
    fn test_epi_recipe_rejects_non_epi_scan() {
        let (labels, reader, params) = scan(1.0, false, 1);
        let config = plain_config();
        let ctx = ReconContext::new(&reader, &params, &config, &NoopRecorder);
        let err = recon_epi(&ctx, &labels, None).unwrap_err();
        assert!(matches!(err, ReconError::InputClassification(_)));
        assert!(err.to_string().contains("this is not an EPI scan"));
    }

    #[test]
    fn test_flow_recipe_rejects_single_segment() {
        let (labels, reader, params) = scan(1.0, false, 1);
        let config = plain_config();
        let ctx = ReconContext::new(&reader, &params, &config, &NoopRecorder);
        let reference = ReferenceImages::from_images(
            Volume::zeros(Shape::new([8, 8, 1])),
            Volume::zeros(Shape::new([8, 8, 1])),
            vec![0],
            [1.0; 3],
        )
        .unwrap();
        let err = recon_flow(&ctx, &labels, &reference).unwrap_err();
        assert!(err.to_string().contains("this is not a flow scan"));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (labels, reader, params) = scan(2.0, false, 2);
        let sequential = plain_config();
        let parallel = ReconConfig { parallel: true, ..plain_config() };
        let timings = TimingLog::new();
        let a = recon_cartesian(&ReconContext::new(&reader, &params, &sequential, &timings), &labels).unwrap();
        let b = recon_cartesian(&ReconContext::new(&reader, &params, &parallel, &NoopRecorder), &labels).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.names(), vec!["data_0_0", "data_1_0"]);
        assert!(timings.summary().iter().any(|(stage, _)| stage == "assemble"));
    }

    #[test]
    fn test_read_k0_includes_rejected() {
        let (mut labels, reader, params) = scan(1.0, false, 1);
        labels[4].typ = LabelType::Rejected;
        let config = plain_config();
        let ctx = ReconContext::new(&reader, &params, &config, &NoopRecorder);
        let k0 = read_k0(&ctx, &labels, 0, 0).unwrap();
        assert_eq!(k0.shape().spatial(), [8, 1, 1]);
        assert!(k0.max_abs() > 0.0);
        assert!(print_labels(&labels).contains("Rejected"));
    }

    #[test]
    fn test_locate_reference_scan() {
        let dir = tempfile::tempdir().unwrap();
        let params = ScanParameters { reference_scan: Some("ref.raw".to_string()), ..ScanParameters::default() };
        assert!(matches!(
            locate_reference_scan(dir.path(), &params),
            Err(ReconError::ReferenceScanMissing(_))
        ));
        assert!(matches!(
            locate_reference_scan(dir.path(), &ScanParameters::default()),
            Err(ReconError::MissingParameter(_))
        ));
    }
}
