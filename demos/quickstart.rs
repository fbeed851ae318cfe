use std::path;

use env_logger;
use log;

use ext_line_sort::ExternalSorterBuilder;

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let sorter = ExternalSorterBuilder::new()
        .with_row_budget(100_000)
        .with_tmp_dir(path::Path::new("./"))
        .build()
        .unwrap();

    let summary = sorter
        .sort(path::Path::new("input.txt"), path::Path::new("output.txt"))
        .unwrap();

    log::info!(
        "{} lines sorted ({} chunks, {} merge rounds)",
        summary.lines,
        summary.chunks,
        summary.rounds
    );
}
