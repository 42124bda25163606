//! Generates Rust trait declarations from D-Bus introspection XML.
//!
//! The document comes from a file, from standard input, or - when a
//! destination is given - from introspecting a live service on the bus. One
//! `pub trait` per interface goes to standard output. Exits 0 on success, 1
//! when the document does not parse, 2 on I/O failure.

use std::io::Read;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};

use objbus::{BusKind, Endpoint, Proxy};

fn main() -> ExitCode {
    let matches = Command::new("objbus-codegen")
        .about("Generates Rust trait declarations from D-Bus introspection XML")
        .arg(Arg::new("destination").short('d').long("destination").value_name("BUSNAME")
            .help("Connects to the supplied service for introspection data; reads a file or stdin otherwise"))
        .arg(Arg::new("path").short('p').long("path").value_name("PATH")
            .help("The object path to introspect; defaults to '/' (only with --destination)"))
        .arg(Arg::new("systembus").short('s').long("system-bus").action(ArgAction::SetTrue)
            .help("Connects to the system bus instead of the session bus (only with --destination)"))
        .arg(Arg::new("file").value_name("FILE")
            .help("Introspection XML document; reads from stdin when absent"))
        .get_matches();

    let source = if let Some(dest) = matches.get_one::<String>("destination") {
        let path = matches.get_one::<String>("path").map(|s| s.as_str()).unwrap_or("/");
        let kind = if matches.get_flag("systembus") { BusKind::System } else { BusKind::Session };
        match fetch_introspection(kind, dest, path) {
            Ok(s) => Ok(s),
            Err(e) => {
                eprintln!("objbus-codegen: {}", e);
                return ExitCode::from(2);
            }
        }
    } else {
        match matches.get_one::<String>("file") {
            Some(path) => std::fs::read_to_string(path),
            None => {
                let mut s = String::new();
                std::io::stdin().read_to_string(&mut s).map(|_| s)
            }
        }
    };
    let source = match source {
        Ok(s) => s,
        Err(e) => {
            eprintln!("objbus-codegen: cannot read input: {}", e);
            return ExitCode::from(2);
        }
    };

    let interfaces = match objbus::introspect::parse_introspection(&source) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("objbus-codegen: {}", e);
            return ExitCode::from(1);
        }
    };

    let mut out = String::new();
    for i in &interfaces {
        out.push_str(&format!("// Interface {}\n", i.name()));
        out.push_str(&i.protocol_declaration());
        out.push('\n');
    }
    print!("{}", out);
    ExitCode::SUCCESS
}

fn fetch_introspection(kind: BusKind, dest: &str, path: &str) -> Result<String, objbus::Error> {
    let service = objbus::BusName::new(dest)?;
    let path = objbus::ObjectPath::new(path)?;
    let endpoint = Endpoint::open(kind)?;
    let proxy = Proxy::new(endpoint.clone(), service, path);
    let xml = proxy.introspect()?;
    endpoint.close();
    Ok(xml)
}
