use rseme::config::ControllerConfig;
use rseme::session::MessageType;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    let usage = "Usage: license_url <config.yml> <key_system> [message_type]";
    let path = args.next().expect(usage);
    let key_system = args.next().expect(usage);
    let message_type = match args.next().as_deref() {
        None | Some("license-request") => MessageType::LicenseRequest,
        Some("license-renewal") => MessageType::LicenseRenewal,
        Some("license-release") => MessageType::LicenseRelease,
        Some("individualization-request") => MessageType::IndividualizationRequest,
        Some(other) => anyhow::bail!("unknown message type {}", other),
    };

    let config = ControllerConfig::from_path(&path)?;
    let protection = config
        .protection_data
        .get(&key_system)
        .ok_or_else(|| anyhow::anyhow!("{} has no protection data", key_system))?;

    match protection.configured_url(message_type) {
        Some(url) => println!("{}: {}", message_type, url),
        None => println!("{}: <none>", message_type),
    }
    for (name, value) in &protection.http_request_headers {
        println!("header {}: {}", name, value);
    }

    Ok(())
}
