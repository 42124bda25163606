// Lists the connections on the session bus by calling ListNames on the bus
// daemon through a dynamic proxy.

use objbus::{Endpoint, Proxy, RemoteObject, Value};

fn main() -> Result<(), objbus::Error> {
    let endpoint = Endpoint::session()?;
    let proxy = Proxy::new(endpoint.clone(),
        "org.freedesktop.DBus".into(), "/org/freedesktop/DBus".into());

    // First use introspects the peer; "list_names" resolves to ListNames.
    let names = proxy.invoke("list_names", &[])?;
    if let Value::Array(names) = names {
        for name in names {
            if let Value::Str(s) = name {
                println!("{}", s);
            }
        }
    }

    let owned = proxy.invoke("name_has_owner", &[Value::from("org.freedesktop.DBus")])?;
    println!("the bus owns its own name: {:?}", owned);

    endpoint.close();
    Ok(())
}
