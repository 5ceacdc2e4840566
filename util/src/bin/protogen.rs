use clap::{App, Arg};
use std::fs;
use std::path::Path;
use std::process::exit;
use util::{emit_c_header, emit_rust, load};

pub fn main() {
    let matches = App::new("Protocol Generator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Emits the Rust and C protocol bindings from the protocol spec.")
        .arg(
            Arg::with_name("SPEC_FILE")
                .help("Path to the protocol spec")
                .default_value("proto/bridge-protocol.toml"),
        )
        .arg(
            Arg::with_name("rust-out")
                .long("rust-out")
                .takes_value(true)
                .default_value("lib/ferrite/src/spec.rs"),
        )
        .arg(
            Arg::with_name("c-out")
                .long("c-out")
                .takes_value(true)
                .default_value("firmware/bridge_protocol.h"),
        )
        .arg(
            Arg::with_name("check")
                .long("check")
                .help("Verify the artefacts match instead of writing them"),
        )
        .get_matches();

    let spec_path = matches.value_of("SPEC_FILE").unwrap();
    let rust_out = matches.value_of("rust-out").unwrap();
    let c_out = matches.value_of("c-out").unwrap();

    let spec = match load(spec_path) {
        Ok(spec) => spec,
        Err(error) => {
            eprintln!("{}", error);
            exit(1);
        }
    };

    let rust = emit_rust(&spec);
    let header = emit_c_header(&spec);

    if matches.is_present("check") {
        let mut stale = false;
        for (path, expected) in [(rust_out, &rust), (c_out, &header)].iter() {
            match fs::read_to_string(path) {
                Ok(committed) if &committed == *expected => (),
                _ => {
                    eprintln!("{} is stale; re-run protogen", path);
                    stale = true;
                }
            }
        }
        if stale {
            exit(1);
        }
        println!("protocol artefacts up to date");
        return;
    }

    write(rust_out, &rust);
    write(c_out, &header);
    println!("wrote {} and {}", rust_out, c_out);
}

fn write(path: &str, content: &str) {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent).expect("Error creating output directory");
    }
    fs::write(path, content).expect("Error writing artefact");
}
