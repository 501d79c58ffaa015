//! Terminal output formatting for all snapvault commands.
//! Uses comfy-table for the transfer counters and colored for
//! severity-aware summary lines.

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use snapvault_core::{
    BackupReport, CloneReport, DistillReport, PurgeReport, StatsSummary, VerifyReport,
};

/// Format the transfer counters as a table.
fn stats_table(stats: &StatsSummary) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Operation"),
            Cell::new("Files"),
            Cell::new("Bytes"),
        ]);

    for (name, files, bytes) in [
        ("hashed", stats.files_hashed, stats.bytes_hashed),
        ("copied", stats.files_copied, stats.bytes_copied),
        ("linked", stats.files_linked, stats.bytes_linked),
        ("deleted", stats.files_deleted, stats.bytes_deleted),
    ] {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(files),
            Cell::new(bytes),
        ]);
    }
    table
}

fn print_outcome(errors: u64, warnings: u64) {
    if errors > 0 {
        println!("{}", format!("{} error(s)", errors).red().bold());
    }
    if warnings > 0 {
        println!("{}", format!("{} warning(s)", warnings).yellow());
    }
    if errors == 0 && warnings == 0 {
        println!("{}", "No errors.".green());
    }
}

/// Print a backup report summary.
pub fn print_backup_summary(report: &BackupReport) {
    println!(
        "{}",
        format!("Snapshot created: {}", report.snapshot_path)
            .green()
            .bold()
    );
    println!("  imported:   {}", report.files_imported);
    println!("  duplicated: {}", report.files_duplicated);
    if report.files_skipped > 0 {
        println!("  skipped:    {}", report.files_skipped);
    }
    let excluded =
        report.excluded_blacklisted + report.excluded_symlink + report.excluded_unknown;
    if excluded > 0 {
        println!(
            "{}",
            format!(
                "  excluded:   {} ({} blacklisted, {} symlinks, {} unknown)",
                excluded,
                report.excluded_blacklisted,
                report.excluded_symlink,
                report.excluded_unknown
            )
            .dimmed()
        );
    }
    println!("{}", stats_table(&report.stats));
    print_outcome(report.errors, report.warnings);
}

/// Print a verify report summary.
pub fn print_verify_summary(report: &VerifyReport) {
    println!(
        "Verified {} file(s) in {} snapshot(s).",
        report.files_verified, report.snapshots_verified
    );
    if let Some(ref path) = report.file_table_path {
        println!("{}", format!("File table written to {}", path).dimmed());
    }
    if report.stats.files_hashed > 0 {
        println!("{}", stats_table(&report.stats));
    }
    print_outcome(report.errors, report.warnings);
}

/// Print a purge report summary.
pub fn print_purge_summary(report: &PurgeReport) {
    if report.rows_purged == 0 {
        println!(
            "{}",
            format!(
                "No dangling index rows in {} snapshot(s).",
                report.snapshots_purged
            )
            .green()
        );
    } else {
        println!(
            "{}",
            format!(
                "Purged {} index row(s) from {} snapshot(s).",
                report.rows_purged, report.snapshots_purged
            )
            .green()
            .bold()
        );
    }
    print_outcome(report.errors, report.warnings);
}

/// Print a distill report summary.
pub fn print_distill_summary(report: &DistillReport) {
    println!(
        "{}",
        format!(
            "Distilled {} snapshot(s): shed {} file(s), kept {} unique file(s).",
            report.snapshots_distilled, report.files_shed, report.files_kept
        )
        .green()
        .bold()
    );
    println!("{}", stats_table(&report.stats));
    print_outcome(report.errors, report.warnings);
}

/// Print a clone report summary.
pub fn print_clone_summary(report: &CloneReport) {
    println!(
        "{}",
        format!(
            "Cloned {} snapshot(s): {} imported, {} duplicated.",
            report.snapshots_cloned, report.files_cloned, report.files_duplicated
        )
        .green()
        .bold()
    );
    if report.files_skipped > 0 {
        println!("  skipped: {}", report.files_skipped);
    }
    println!("{}", stats_table(&report.stats));
    print_outcome(report.errors, report.warnings);
}
