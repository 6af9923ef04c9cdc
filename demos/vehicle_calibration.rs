//! Vehicle Camera Calibration Demo
//!
//! Runs the whole pipeline on synthetic observations of a 9x6 checkerboard:
//! - intrinsic calibration of a fisheye (Kannala-Brandt) camera
//! - camera-to-vehicle extrinsics from a manual measurement
//! - camera-to-vehicle extrinsics from a checkerboard placed in front of the
//!   vehicle
//! - persistence of both results and reloading of the extrinsics
//!
//! Usage:
//! ```bash
//! RUST_LOG=debug cargo run --example vehicle_calibration
//! ```

use nalgebra::Vector3;
use vehicle_camera_calib::calibration::synthetic::{calibration_views, observe};
use vehicle_camera_calib::calibration::CoverageAnalyzer;
use vehicle_camera_calib::{
    load_document, save_document, AngleUnit, CameraIntrinsics, CameraModel, EulerAngles, ExtrinsicConfig,
    ExtrinsicDocument, ExtrinsicEngine, IntrinsicAccumulator, IntrinsicConfig, IntrinsicDocument,
    Intrinsics, LensModel, PatternPlacement, Resolution, RigidTransform, VEHICLE_EULER_ORDER,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("VEHICLE CAMERA CALIBRATION");
    println!("==========================\n");

    // Step 1: Intrinsic calibration
    println!("Step 1: Intrinsic calibration");
    println!("-----------------------------");
    let truth = CameraIntrinsics::new(
        LensModel::KannalaBrandt,
        Intrinsics {
            fx: 460.0,
            fy: 458.0,
            cx: 640.5,
            cy: 400.2,
        },
        Resolution {
            width: 1280,
            height: 800,
        },
        &[0.012, -0.004, 0.0011, -0.0002],
    )?;

    let config = IntrinsicConfig {
        lens: LensModel::KannalaBrandt,
        ..IntrinsicConfig::default()
    };
    let mut accumulator = IntrinsicAccumulator::new(config.clone())?;
    for set in calibration_views(&truth, &config.pattern, 0.35, 10, 0.25)? {
        accumulator.add(set)?;
    }
    // A frame where the detector found nothing.
    if let Err(err) = accumulator.add_detection("blurred_frame", None) {
        println!("   Skipped: {}", err);
    }

    let resolution = truth.get_resolution();
    let intrinsic = accumulator.solve(resolution.width, resolution.height)?;
    let k = intrinsic.camera.get_intrinsics();
    println!(
        "   Solved: fx={:.2}, fy={:.2}, cx={:.2}, cy={:.2}",
        k.fx, k.fy, k.cx, k.cy
    );
    println!("   Distortion: {:?}", intrinsic.camera.get_distortion());
    println!("   RMS reprojection error: {:.4} px", intrinsic.rms_error);
    println!(
        "   {:?}",
        accumulator.reprojection_statistics(&intrinsic)?
    );

    let coverage = accumulator.coverage(&CoverageAnalyzer::default(), &resolution);
    println!(
        "   Coverage: {:.1}% of cells observed, {} cells need more images\n",
        coverage.covered_fraction() * 100.0,
        coverage.regions_needing_images().len()
    );

    let output_dir = std::env::temp_dir().join("vehicle_camera_calib_demo");
    std::fs::create_dir_all(&output_dir)?;
    let mean = accumulator.reprojection_error(&intrinsic)?;
    save_document(
        &IntrinsicDocument::from_result(&intrinsic, Some(mean)),
        output_dir.join("intrinsics.yaml"),
    )?;

    // Step 2: Manual extrinsics
    println!("Step 2: Manual extrinsics");
    println!("-------------------------");
    let mut manual = ExtrinsicEngine::new(ExtrinsicConfig::default());
    let result = manual.from_manual_measurement(
        Vector3::new(1.5, 0.0, 1.8),
        0.0,
        -10.0,
        0.0,
        AngleUnit::Degrees,
    )?;
    let point = manual
        .point_transformer()
        .transform_point(&Vector3::new(0.0, 0.0, 2.0))?;
    println!("   rpy (deg): {:?}", result.euler.to_degrees());
    println!(
        "   Camera point (0, 0, 2) -> vehicle ({:.4}, {:.4}, {:.4})\n",
        point.x, point.y, point.z
    );

    // Step 3: Checkerboard extrinsics
    println!("Step 3: Checkerboard extrinsics");
    println!("-------------------------------");
    let placement = PatternPlacement::new(
        Vector3::new(2.2, 0.1, 0.9),
        EulerAngles::from_degrees(0.0, 0.0, 0.0),
    );
    // Camera mounted 1.4 m above the rear axle, 0.8 m forward, looking ahead
    // and slightly down.
    let mounted = RigidTransform::from_euler(
        &EulerAngles::from_degrees(-90.0 - 8.0, 0.0, -90.0),
        VEHICLE_EULER_ORDER,
        Vector3::new(0.8, 0.0, 1.4),
    );
    let pattern_to_camera = mounted.inverse().compose(&placement.pattern_to_vehicle());
    let observation = observe(
        "board_front",
        &intrinsic.camera,
        &config.pattern,
        &pattern_to_camera,
        0.2,
    )?;

    let mut engine = ExtrinsicEngine::new(ExtrinsicConfig::default());
    let solved = engine.from_pattern(&observation, &intrinsic.camera, &placement)?;
    let t = solved.camera_to_vehicle.translation();
    println!("   Translation: ({:.4}, {:.4}, {:.4}) m", t.x, t.y, t.z);
    println!("   rpy (deg): {:?}", solved.euler.to_degrees());
    println!(
        "   Translation error vs. mounting: {:.2} mm\n",
        (t - mounted.translation()).norm() * 1000.0
    );

    // Step 4: Persist and reload
    println!("Step 4: Persist and reload");
    println!("--------------------------");
    let path = output_dir.join("extrinsics.json");
    save_document(&ExtrinsicDocument::from(&solved), &path)?;
    let document: ExtrinsicDocument = load_document(&path)?;
    let mut reloaded = ExtrinsicEngine::default();
    reloaded.load_from(&document)?;
    println!("   Written and reloaded {}", path.display());

    Ok(())
}
