use clap::{App, Arg, ArgMatches, SubCommand};
use shmkit::{
    memory::{OpenMode, Segment, SegmentConfig, SegmentStats},
    Result, ShmBox, ShmError, ShmHashMap, ShmSnapshot, ShmString,
};
use std::{path::PathBuf, str::FromStr};

/// Root slot the demo journal is published in
const JOURNAL_SLOT: usize = 0;

type Journal = ShmHashMap<u64, ShmString>;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn segment_args<'a, 'b>(command: App<'a, 'b>) -> App<'a, 'b> {
    command
        .arg(
            Arg::with_name("id")
                .short("i")
                .long("id")
                .value_name("ID")
                .help("Segment identifier (at most 15 bytes)")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("file")
                .short("f")
                .long("file")
                .value_name("FILE")
                .help("Backing file path (default: $TMPDIR/shmkit_<ID>)")
                .takes_value(true),
        )
}

fn run() -> Result<()> {
    let matches = App::new("shmkit-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect and exercise shmkit shared memory segments")
        .subcommand(
            segment_args(
                SubCommand::with_name("create").about("Create and format a file-backed segment"),
            )
                .arg(
                    Arg::with_name("min_order")
                        .long("min-order")
                        .value_name("ORDER")
                        .help("log2 of the smallest block")
                        .default_value("4")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("max_order")
                        .long("max-order")
                        .value_name("ORDER")
                        .help("log2 of the storage area")
                        .default_value("20")
                        .takes_value(true),
                ),
        )
        .subcommand(segment_args(
            SubCommand::with_name("inspect").about("Show header and allocator statistics"),
        ))
        .subcommand(segment_args(
            SubCommand::with_name("demo").about("Append a journal entry that survives across runs"),
        ))
        .subcommand(
            segment_args(
                SubCommand::with_name("snapshot").about("Write the demo journal to a file"),
            )
            .arg(
                Arg::with_name("output")
                    .short("o")
                    .long("output")
                    .value_name("OUTPUT")
                    .help("Snapshot file to write")
                    .required(true)
                    .takes_value(true),
            ),
        )
        .subcommand(segment_args(
            SubCommand::with_name("remove").about("Remove the backing file of a segment"),
        ))
        .subcommand(SubCommand::with_name("info").about("Show version and layout constants"))
        .get_matches();

    match matches.subcommand() {
        ("create", Some(create_matches)) => create_segment(create_matches),
        ("inspect", Some(inspect_matches)) => inspect_segment(inspect_matches),
        ("demo", Some(demo_matches)) => run_demo(demo_matches),
        ("snapshot", Some(snapshot_matches)) => snapshot_journal(snapshot_matches),
        ("remove", Some(remove_matches)) => remove_segment(remove_matches),
        ("info", Some(_)) => show_info(),
        _ => {
            println!("Use --help for usage information");
            Ok(())
        }
    }
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<T> {
    let raw = matches
        .value_of(name)
        .ok_or_else(|| ShmError::invalid_parameter(name, "missing value"))?;
    raw.parse()
        .map_err(|_| ShmError::invalid_parameter(name, format!("cannot parse {:?}", raw)))
}

fn segment_config(matches: &ArgMatches, mode: OpenMode) -> Result<SegmentConfig> {
    let identifier: String = parse_arg(matches, "id")?;
    let mut config = SegmentConfig::new(identifier).with_mode(mode);
    if let Some(file) = matches.value_of("file") {
        config = config.with_file_path(PathBuf::from(file));
    }
    Ok(config)
}

fn create_segment(matches: &ArgMatches) -> Result<()> {
    let min_order: u32 = parse_arg(matches, "min_order")?;
    let max_order: u32 = parse_arg(matches, "max_order")?;
    let config = segment_config(matches, OpenMode::Create)?.with_orders(min_order, max_order);
    let path = config.default_file_path();

    let segment = Segment::attach(config)?;
    segment.flush()?;
    println!(
        "Created segment '{}' at {} ({} bytes, storage {} bytes)",
        segment.identifier(),
        path.display(),
        segment.size(),
        segment.layout().storage_size
    );
    Ok(())
}

fn inspect_segment(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::attach(segment_config(matches, OpenMode::Open)?)?;
    let header = segment.header();
    print_stats(&segment.stats());

    println!("Header:");
    println!("  Magic: {:#010x}", header.magic());
    println!("  Layout version: {}", header.version());
    println!("  Orders: {}..={}", header.min_order(), header.max_order());
    for slot in 0..shmkit::ROOT_SLOTS {
        let root = segment.root::<u8>(slot)?;
        if root.is_null() {
            println!("  Root {}: (unset)", slot);
        } else {
            println!("  Root {}: {:#x}", slot, root.offset());
        }
    }
    Ok(())
}

fn print_stats(stats: &SegmentStats) {
    let allocator = &stats.allocator;
    println!("Segment '{}' ({})", stats.identifier, stats.backing_type.name());
    println!("  Total size: {} bytes", stats.total_size);
    println!("  Visits: {}", stats.visit_count);
    if let Some(age) = stats.age_seconds() {
        println!("  Age: {}s", age);
    }
    println!("Allocator:");
    println!("  Storage: {} bytes", allocator.total_bytes);
    println!("  Used: {} bytes in {} blocks", allocator.used_bytes, allocator.live_blocks);
    println!("  Available: {} bytes", allocator.available_bytes);
    println!("  Largest free block: {} bytes", allocator.largest_free_block);
}

fn run_demo(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::attach(segment_config(matches, OpenMode::CreateOrOpen)?)?;
    let arena = segment.arena();

    let root = segment.root::<Journal>(JOURNAL_SLOT)?;
    let mut journal = if root.is_null() {
        arena.new_object(Journal::new())?
    } else {
        // SAFETY: only this demo writes the journal slot, always with a
        // journal created by `new_object` in this segment.
        unsafe { ShmBox::from_raw(root) }
    };

    let visit = u64::from(segment.visit_count());
    let note = format!("visit {} from pid {}", visit, std::process::id());
    let note = ShmString::from_str(arena, &note)?;
    arena.get_mut(&mut journal)?.insert(arena, visit, note)?;

    let mut entries = Vec::new();
    for entry in arena.get(&journal)?.iter(arena) {
        let (key, value) = entry?;
        entries.push((*key, value.to_string_lossy(arena)?));
    }
    entries.sort();

    println!(
        "Journal of segment '{}' (mapped at {:p}):",
        segment.identifier(),
        segment.base_address()
    );
    for (key, value) in entries {
        println!("  {:>4}: {}", key, value);
    }

    segment.set_root(JOURNAL_SLOT, journal.into_raw())?;
    segment.flush()?;
    Ok(())
}

fn snapshot_journal(matches: &ArgMatches) -> Result<()> {
    let segment = Segment::attach(segment_config(matches, OpenMode::Open)?)?;
    let output: PathBuf = parse_arg(matches, "output")?;

    let root = segment.root::<Journal>(JOURNAL_SLOT)?;
    if root.is_null() {
        return Err(ShmError::invalid_parameter("id", "segment has no demo journal"));
    }
    // SAFETY: see `run_demo`. The handle goes back to a raw offset below, so
    // the journal stays owned by the segment.
    let journal = unsafe { ShmBox::from_raw(root) };
    let arena = segment.arena();
    let encoded = arena
        .get(&journal)
        .and_then(|map| Ok((map.len(), journal.to_snapshot(arena)?)));
    let _ = journal.into_raw();
    let (entries, bytes) = encoded?;

    std::fs::write(&output, &bytes)
        .map_err(|e| ShmError::from_io(e, "failed to write snapshot"))?;
    println!(
        "Wrote {} entries ({} bytes) of '{}' to {}",
        entries,
        bytes.len(),
        segment.identifier(),
        output.display()
    );
    Ok(())
}

fn remove_segment(matches: &ArgMatches) -> Result<()> {
    let config = segment_config(matches, OpenMode::Open)?;
    Segment::unlink(&config)?;
    println!("Removed {}", config.default_file_path().display());
    Ok(())
}

fn show_info() -> Result<()> {
    println!("shmkit v{}", shmkit::VERSION);
    println!("Segment magic: {:#010x}", shmkit::memory::SEGMENT_MAGIC);
    println!("Layout version: {}", shmkit::memory::LAYOUT_VERSION);
    println!("Root slots: {}", shmkit::ROOT_SLOTS);
    println!(
        "Orders: {}..={}",
        shmkit::allocators::buddy::MIN_ORDER_LIMIT,
        shmkit::allocators::buddy::MAX_ORDER_LIMIT
    );
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "(unset)".into());
    println!("Log filter: RUST_LOG={}", filter);
    Ok(())
}
