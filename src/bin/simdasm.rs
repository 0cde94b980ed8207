use log::debug;
use simscript::call_graph::{CallGraphBuilder, EntryPointProvider, ScopeResolver};
use simscript::chunk::{extract_chunks, ChunkKind};
use simscript::opcode_table::DEFAULT_TABLE;
use simscript::routine::{Routine, Scope};
use simscript::tracer::trace_routine;
use std::collections::HashSet;
use std::env;
use std::fs::File;
use std::io::Read;

/// Resolves calls against the routines decoded from the container
/// itself. Global and semi-global libraries live in other containers,
/// so only local ids resolve here; the rest surface as findings.
struct ContainerResolver {
    locals: HashSet<u16>,
}

impl ScopeResolver for ContainerResolver {
    fn resolve(&self, scope: Scope, id: u16) -> Option<u16> {
        match scope {
            Scope::Local if self.locals.contains(&id) => Some(id),
            _ => None,
        }
    }
}

struct NoEntries;

impl EntryPointProvider for NoEntries {
    fn entry_points(&self) -> Vec<u16> {
        Vec::new()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();

    // Parse command line options
    let mut show_trace = false;
    let mut show_dot = false;
    let mut filename = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-t" | "--trace" => show_trace = true,
            "-g" | "--dot" => show_dot = true,
            "-h" | "--help" => {
                eprintln!("Usage: {} [options] <container-file>", args[0]);
                eprintln!("\nOptions:");
                eprintln!("  -t, --trace   Show reachability and loop analysis per routine");
                eprintln!("  -g, --dot     Emit the call graph in DOT form");
                eprintln!("  -h            Show this help message");
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                filename = Some(arg.to_string());
                break;
            }
            _ => {
                eprintln!("Unknown option: {}", args[i]);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let filename = filename.unwrap_or_else(|| {
        eprintln!("Usage: {} [options] <container-file>", args[0]);
        eprintln!("Try '{} -h' for help", args[0]);
        std::process::exit(1);
    });

    let mut file = File::open(&filename)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    debug!("Loaded {} bytes from {}", buffer.len(), filename);

    let (chunks, chunk_errors) = extract_chunks(&buffer);
    println!("{}: {} chunk(s)", filename, chunks.len());
    for error in &chunk_errors {
        eprintln!("container error: {}", error);
    }

    let table = &*DEFAULT_TABLE;
    let mut routines = Vec::new();
    for chunk in &chunks {
        if chunk.kind() != Some(ChunkKind::BehaviorRoutine) {
            println!("  {} {} ({} bytes)", chunk.tag_str(), chunk.id, chunk.payload.len());
            continue;
        }
        match Routine::decode(chunk.id, Scope::Local, &chunk.payload) {
            Ok((routine, findings)) => {
                print!("{}", routine);
                for finding in &findings {
                    println!("    {}", finding);
                }
                if show_trace {
                    let trace = trace_routine(&routine, table);
                    println!(
                        "    reachable: {:?}, unreachable: {:?}",
                        trace.reachable_indices(),
                        trace.unreachable_indices()
                    );
                    for edge in &trace.back_edges {
                        println!(
                            "    loop {} -> {} ({})",
                            edge.from,
                            edge.to,
                            if edge.bounded { "bounded" } else { "unbounded" }
                        );
                    }
                }
                routines.push(routine);
            }
            Err(error) => {
                // Scoped to the one chunk; keep going.
                eprintln!("  BHAV {}: {}", chunk.id, error);
            }
        }
    }

    let resolver = ContainerResolver {
        locals: routines.iter().map(|r| r.id).collect(),
    };
    let graph = CallGraphBuilder::new(table, &resolver, &NoEntries).build(&routines);
    for finding in graph.findings() {
        println!("{}", finding);
    }
    if show_dot {
        print!("{}", graph.to_dot());
    } else {
        println!(
            "call graph: {} routine(s), {} edge(s), {} orphan(s)",
            routines.len(),
            graph.edges().len(),
            graph.orphans().len()
        );
    }

    Ok(())
}
