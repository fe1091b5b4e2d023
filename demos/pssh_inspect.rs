use rseme::pssh::parse_pssh_list;
use rseme::resolver::{ExtensionResolver, Extensions};
use rseme::session::SessionType;
use rseme::utils::b64_decode;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let input = std::env::args()
        .nth(1)
        .expect("Usage: pssh_inspect <init_data_base64>");
    let init_data = b64_decode(&input)?;

    let entries = parse_pssh_list(&init_data);
    if entries.is_empty() {
        println!("boxes: <none>");
    }
    for entry in &entries {
        println!(
            "pssh v{} system_id: {} ({} bytes of data)",
            entry.pssh.version,
            entry.pssh.system_id,
            entry.pssh.init_data.len()
        );
        for kid in entry.pssh.key_ids() {
            println!("  kid: {}", kid);
        }
    }

    let extensions = Extensions::new();
    for candidate in extensions.candidates_for(&init_data, SessionType::Temporary) {
        let url = extensions
            .init_data_for(&candidate.key_system, &init_data)
            .and_then(|d| extensions.license_url_from_init_data(&candidate.key_system, &d));
        println!(
            "candidate: {} ({}){}",
            candidate.name,
            candidate.key_system,
            url.map(|u| format!(" license url {}", u)).unwrap_or_default()
        );
    }

    Ok(())
}
