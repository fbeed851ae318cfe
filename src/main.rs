use std::path;
use std::process;
use std::time;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_line_sort::{CleanupPolicy, ExternalSorter, ExternalSorterBuilder, Line};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let row_budget: usize = arg_parser.value_of_t_or_exit("rows");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let scratch_root: Option<&str> = arg_parser.value_of("scratch_root");
    let io_buffer: Option<&str> = arg_parser.value_of("io_buffer");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let input = path::Path::new(arg_parser.value_of("input").expect("value is required"));
    let output = path::Path::new(arg_parser.value_of("output").expect("value is required"));

    let mut sorter_builder = ExternalSorterBuilder::new().with_row_budget(row_budget);
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(scratch_root) = scratch_root {
        sorter_builder = sorter_builder.with_scratch_root(path::Path::new(scratch_root));
    }

    if let Some(io_buffer) = io_buffer {
        let io_buffer = parse_buf_size(io_buffer).expect("value is pre-validated");
        sorter_builder = sorter_builder.with_rw_buf_size(io_buffer);
    }

    if arg_parser.is_present("keep_on_failure") {
        sorter_builder = sorter_builder.with_cleanup(CleanupPolicy::KeepOnFailure);
    }

    let sorter: ExternalSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let started = time::Instant::now();
    let result = match order {
        Order::Asc => sorter.sort(input, output),
        Order::Desc => sorter.sort_by(input, output, |a: &Line, b: &Line| a.cmp(b).reverse()),
    };

    match result {
        Ok(summary) => log::info!(
            "{} lines sorted in {:.3} sec",
            summary.lines,
            started.elapsed().as_secs_f64()
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-line-sort")
        .about("bounded-memory external sorter of text lines")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("rows")
                .short('r')
                .long("rows")
                .help("maximum number of lines held in memory (at least 4)")
                .takes_value(true)
                .default_value("100000")
                .validator(|v| match v.parse::<usize>() {
                    Ok(rows) if rows >= 4 => Ok(()),
                    Ok(rows) => Err(format!("Row budget too small: {}", rows)),
                    Err(err) => Err(format!("Row budget format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for chunk sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory a scratch directory is created in")
                .takes_value(true)
                .conflicts_with("scratch_root"),
        )
        .arg(
            clap::Arg::new("scratch_root")
                .long("scratch-root")
                .help("exact scratch directory, its contents are removed before sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("io_buffer")
                .short('b')
                .long("io-buffer")
                .help("run files read/write buffer size")
                .takes_value(true)
                .validator(|v| parse_buf_size(v).map(|_| ())),
        )
        .arg(
            clap::Arg::new("keep_on_failure")
                .long("keep-on-failure")
                .help("keep scratch data for diagnosis if sorting fails"),
        )
        .get_matches()
}

fn parse_buf_size(value: &str) -> Result<usize, String> {
    let size = value
        .parse::<ByteSize>()
        .map_err(|err| format!("Buffer size format incorrect: {}", err))?;

    usize::try_from(size.as_u64()).map_err(|_| format!("Buffer size too large: {}", size))
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::parse_buf_size;

    #[rstest]
    #[case("0", Some(0))]
    #[case("512", Some(512))]
    #[case("4 KiB", Some(4096))]
    #[case("1MB", Some(1_000_000))]
    #[case("lots", None)]
    fn test_parse_buf_size(#[case] value: &str, #[case] expected: Option<usize>) {
        assert_eq!(parse_buf_size(value).ok(), expected);
    }

    #[cfg(target_pointer_width = "32")]
    #[rstest]
    fn test_parse_buf_size_overflow() {
        assert!(parse_buf_size("8 GiB").is_err());
    }
}
