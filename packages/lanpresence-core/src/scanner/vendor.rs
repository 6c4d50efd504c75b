//! MAC address handling and OUI-based device classification.
//!
//! Uses the IEEE OUI database to guess what kind of device sits
//! behind a MAC address, so freshly discovered devices get a usable
//! class tag before their owner ever names them.

use crate::tracker::DeviceClass;

/// Normalize a MAC address to the canonical `AA:BB:CC:DD:EE:FF` form.
///
/// Accepts `:`/`-`/`.` separated octets (single hex digits allowed,
/// as `arp -n` prints them on macOS) or a bare 12-digit hex string.
/// Returns `None` for anything that is not a full 48-bit address.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let mac = mac.trim();

    // Colon/dash separated octets first, so single-digit octets keep
    // their position.
    if mac.contains([':', '-']) {
        let octets: Vec<String> = mac
            .split([':', '-'])
            .map(|part| {
                if part.is_empty()
                    || part.len() > 2
                    || !part.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return None;
                }
                Some(format!("{:0>2}", part.to_uppercase()))
            })
            .collect::<Option<Vec<_>>>()?;
        if octets.len() != 6 {
            return None;
        }
        return Some(octets.join(":"));
    }

    // Bare hex, optionally dot-grouped (`aabb.ccdd.eeff`).
    let cleaned = mac.replace('.', "");
    if cleaned.len() != 12 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let upper = cleaned.to_uppercase();
    let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(octets.join(":"))
}

/// Lookup the vendor/manufacturer name for a MAC address.
pub fn lookup_vendor(mac: &str) -> Option<String> {
    let normalized = normalize_mac(mac)?;

    match oui_data::lookup(&normalized) {
        Some(record) => {
            let vendor = record.organization().to_string();
            tracing::debug!("OUI lookup for {}: {}", normalized, vendor);
            Some(vendor)
        }
        None => {
            tracing::debug!("OUI lookup for {}: not found", normalized);
            None
        }
    }
}

/// Map a vendor name onto the tracker's device classes. This is a
/// heuristic; owners can always override the class afterwards.
pub fn infer_class(vendor: &str) -> Option<DeviceClass> {
    let vendor = vendor.to_lowercase();

    if vendor.contains("samsung electronics")
        || vendor.contains("xiaomi")
        || vendor.contains("huawei")
        || vendor.contains("oneplus")
        || vendor.contains("oppo")
        || vendor.contains("vivo")
        || vendor.contains("motorola")
        || vendor.contains("htc")
    {
        return Some(DeviceClass::Smartphone);
    }

    if vendor.contains("cisco")
        || vendor.contains("ubiquiti")
        || vendor.contains("netgear")
        || vendor.contains("tp-link")
        || vendor.contains("linksys")
        || vendor.contains("d-link")
        || vendor.contains("mikrotik")
        || vendor.contains("asustek")
        || vendor.contains("zyxel")
        || vendor.contains("keenetic")
    {
        return Some(DeviceClass::Router);
    }

    if vendor.contains("lg electronics")
        || vendor.contains("vizio")
        || vendor.contains("roku")
        || vendor.contains("tcl")
        || vendor.contains("hisense")
    {
        return Some(DeviceClass::Tv);
    }

    if vendor.contains("sony interactive")
        || vendor.contains("nintendo")
        || vendor.contains("microsoft xbox")
    {
        return Some(DeviceClass::Console);
    }

    if vendor.contains("intel corporate")
        || vendor.contains("dell")
        || vendor.contains("lenovo")
        || vendor.contains("hewlett packard")
        || vendor.contains("micro-star")
        || vendor.contains("gigabyte")
    {
        return Some(DeviceClass::Pc);
    }

    if vendor.contains("garmin") || vendor.contains("fitbit") {
        return Some(DeviceClass::Watch);
    }

    // Apple spans phones, tablets, laptops and watches; without more
    // signal, a phone is the likeliest guess on a home network.
    if vendor.contains("apple") {
        return Some(DeviceClass::Smartphone);
    }

    None
}
