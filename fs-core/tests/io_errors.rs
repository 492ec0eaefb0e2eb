//! Failed sector reads

mod common;

use ufsck::config::{CheckConfig, RunMode};
use ufsck::dir::lookup;
use ufsck::format::ROOTINO;
use ufsck::image::ImageBuilder;
use ufsck::report::RunStatus;

use common::{populated, run_with};

#[test]
fn test_too_many_errors_requests_rerun() {
    let (builder, _) = populated();
    let image = builder.build().unwrap();
    let sb = image.superblock();
    let first = sb.iblkno as u64 * sb.fsize as u64 / 512;
    image.device().fail_sector(first);
    let writes = image.device().write_count();

    let config = CheckConfig {
        io_error_tolerance: 0,
        ..CheckConfig::with_mode(RunMode::Preen)
    };
    let report = run_with(&image, config);
    assert_eq!(report.status, RunStatus::Rerun);
    assert_eq!(report.status.exit_code(), 4);
    assert!(report.error.is_some());
    assert_eq!(image.device().write_count(), writes);
}

#[test]
fn test_tolerated_error_reads_as_zeros() {
    let mut builder = ImageBuilder::new();
    builder.add_file(ROOTINO, "f", 100).unwrap();
    let mut image = builder.build().unwrap();
    let sector = image
        .modify(|vol| {
            let lf = lookup(vol, ROOTINO, b"lost+found")?.unwrap();
            Ok(vol.read_inode(lf)?.db(0) * vol.geo.fsize / 512)
        })
        .unwrap();
    image.device().fail_sector(sector);

    let report = run_with(&image, CheckConfig::with_mode(RunMode::ReadOnly));
    assert!(report.error.is_none(), "{:?}", report.error);
    assert!(report.cache.read_errors > 0);
    assert_eq!(report.status, RunStatus::Unresolved);
}
