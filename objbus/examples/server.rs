// Exports a small object on the session bus. Peers can introspect it and
// call Hello on com.example.objbus.Greeter (or on the reflected class
// interface).

use std::sync::Arc;
use std::time::Duration;

use objbus::{Endpoint, Error, ErrorKind, HostMethodDesc, HostObject, Value};

struct Greeter;

impl HostObject for Greeter {
    fn class_name(&self) -> &str { "Greeter" }

    fn declared_methods(&self) -> Vec<HostMethodDesc> {
        vec![HostMethodDesc {
            selector: "hello".to_string(),
            in_args: vec![(Some("name".to_string()), "s".to_string())],
            out_args: vec!["s".to_string()],
        }]
    }

    fn invoke(&self, selector: &str, args: &[Value]) -> Result<Value, Error> {
        match (selector, args) {
            ("hello", [Value::Str(name)]) => Ok(Value::Str(format!("Hello, {}!", name))),
            _ => Err(Error::new(ErrorKind::TypeMismatch, "unknown selector")),
        }
    }
}

fn main() -> Result<(), Error> {
    let endpoint = Endpoint::session()?;
    endpoint.request_name(&"com.example.objbus".into(), true)?;
    endpoint.export_object("/greeter", Arc::new(Greeter))?;
    println!("serving /greeter as {}", endpoint.unique_name().unwrap_or_default());

    while endpoint.is_running() {
        std::thread::sleep(Duration::from_millis(500));
    }
    Ok(())
}
