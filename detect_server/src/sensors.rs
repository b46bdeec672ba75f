//! Local V4L2 cameras.
//!
use image::ImageFormat;
use rscam::{Camera, Config};

use crate::sources::{Capture, FrameSource, SourceError};

const MJPG: &[u8] = b"MJPG";

/// Open `device_name` streaming MJPG at its highest resolution and frame rate.
pub fn open_max_res_mjpg_camera(device_name: &str) -> Result<Camera, SourceError> {
    let mut cam = Camera::new(device_name)?;
    log_supported_formats(&cam);

    let resolution = get_max_resolution(&cam, MJPG)?;
    let frame_rate = get_max_frame_rate(&cam, MJPG, resolution)?;
    log::info!(
        "Using camera {} at {}x{}, interval {}/{}s",
        device_name,
        resolution.0,
        resolution.1,
        frame_rate.0,
        frame_rate.1
    );

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format: MJPG,
        ..Default::default()
    })
    .map_err(device_error)?;

    Ok(cam)
}

/// Camera decoded frame by frame for live detection.
pub struct CameraSource {
    device_name: String,
    cam: Option<Camera>,
}

impl CameraSource {
    pub fn open(device_name: &str) -> Result<Self, SourceError> {
        Ok(Self {
            device_name: device_name.to_owned(),
            cam: Some(open_max_res_mjpg_camera(device_name)?),
        })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Capture, SourceError> {
        let Some(cam) = self.cam.as_ref() else {
            return Ok(Capture::Exhausted);
        };

        let frame = cam.capture()?;
        match image::load_from_memory_with_format(&frame[..], ImageFormat::Jpeg) {
            Ok(image) => Ok(Capture::Frame(image.to_rgb8())),
            Err(e) => {
                log::warn!("Skipping broken frame from {}: {}", self.device_name, e);
                Ok(Capture::Idle)
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut cam) = self.cam.take() {
            if let Err(e) = cam.stop() {
                log::warn!("Failed to stop camera {}: {}", self.device_name, e);
            }
            log::info!("Released camera {}", self.device_name);
        }
    }
}

fn device_error(err: rscam::Error) -> SourceError {
    SourceError::Device(err.to_string())
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), SourceError> {
    let resolution_info = cam.resolutions(format).map_err(device_error)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| SourceError::Device("no resolution found".into()))
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), SourceError> {
    let interval_info = cam.intervals(format, resolution).map_err(device_error)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) seconds per frame
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .max_by_key(|(num, den)| den / num.max(&1))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| SourceError::Device("no frame rate found".into()))
}

fn log_supported_formats(cam: &Camera) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!("Supported formats: {:?}, using MJPG", formats);
}
