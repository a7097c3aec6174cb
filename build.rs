use std::fs;
use std::path::Path;

/// Keys read from `device_config.h` and exported to the firmware as compile-time env vars.
const CONFIG_KEYS: &[(&str, &str)] = &[
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("OTA_SERVER_IP", "192.168.0.3"),
    ("OTA_SERVER_PORT", "8070"),
    ("OTA_FILENAME", "/esproom.bin"),
];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    let config_path = "device_config.h";
    println!("cargo:rerun-if-changed={}", config_path);

    let contents = if Path::new(config_path).exists() {
        fs::read_to_string(config_path)?
    } else {
        println!("cargo:warning=device_config.h not found! Copy device_config.h.example to device_config.h and add your credentials.");
        String::new()
    };

    for (key, default) in CONFIG_KEYS {
        let define = format!("#define {} ", key);
        let value = contents
            .lines()
            .find(|l| l.trim_start().starts_with(&define))
            .and_then(|l| l.split('"').nth(1))
            .unwrap_or(default);
        println!("cargo:rustc-env={}={}", key, value);
    }

    Ok(())
}
