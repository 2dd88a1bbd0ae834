//! Host-native namespaces bound into every instance next to the preloaded
//! libraries: `CryptoJS`, `moment`, `iconv`, `xml` and `apilib`.

use chrono::{DateTime, SecondsFormat, Utc};
use rhai::{Blob, INT, ImmutableString, Module, Shared};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{GuestResult, guest_error};
use crate::{host_api, xml};

/// The host-native modules, built once and shared by every instance.
#[derive(Clone)]
pub struct HostModules {
    modules: Vec<(&'static str, Shared<Module>)>,
}

impl HostModules {
    pub fn standard() -> Self {
        Self {
            modules: vec![
                ("CryptoJS", crypto_module()),
                ("moment", moment_module()),
                ("iconv", iconv_module()),
                (xml::NAMESPACE, xml::module()),
                (host_api::NAMESPACE, host_api::module()),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Shared<Module>)> + '_ {
        self.modules
            .iter()
            .map(|(namespace, module)| (*namespace, module.clone()))
    }
}

fn hex_digest<D: Digest>(data: &[u8]) -> String {
    hex::encode(D::digest(data))
}

fn crypto_module() -> Shared<Module> {
    let mut module = Module::new();

    macro_rules! digest_fn {
        ($module:ident, $name:literal, $hasher:ty) => {
            $module.set_native_fn($name, |text: ImmutableString| -> GuestResult<String> {
                Ok(hex_digest::<$hasher>(text.as_bytes()))
            });
            $module.set_native_fn($name, |data: Blob| -> GuestResult<String> {
                Ok(hex_digest::<$hasher>(&data))
            });
        };
    }

    digest_fn!(module, "SHA224", Sha224);
    digest_fn!(module, "SHA256", Sha256);
    digest_fn!(module, "SHA384", Sha384);
    digest_fn!(module, "SHA512", Sha512);

    module.build_index();
    module.into()
}

fn format_millis(millis: INT) -> GuestResult<String> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| guest_error(format!("RangeError: timestamp {millis} out of range")))
}

fn parse_millis(text: &str) -> GuestResult<INT> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.timestamp_millis())
        .map_err(|e| guest_error(format!("invalid timestamp {text:?}: {e}")))
}

fn moment_module() -> Shared<Module> {
    let mut module = Module::new();
    module.set_native_fn("now", || -> GuestResult<INT> { Ok(Utc::now().timestamp_millis()) });
    module.set_native_fn("format", format_millis);
    module.set_native_fn("parse", |text: ImmutableString| parse_millis(&text));
    module.build_index();
    module.into()
}

fn encode_text(text: &str, encoding: &str) -> GuestResult<Blob> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(text.as_bytes().to_vec()),
        "hex" => hex::decode(text).map_err(|e| guest_error(format!("invalid hex: {e}"))),
        "latin1" | "binary" => text
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c))
                    .map_err(|_| guest_error(format!("character {c:?} is not representable in latin1")))
            })
            .collect(),
        other => Err(guest_error(format!("unsupported encoding {other:?}"))),
    }
}

fn decode_bytes(data: &[u8], encoding: &str) -> GuestResult<String> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(data).into_owned()),
        "hex" => Ok(hex::encode(data)),
        "latin1" | "binary" => Ok(data.iter().map(|&b| char::from(b)).collect()),
        other => Err(guest_error(format!("unsupported encoding {other:?}"))),
    }
}

fn iconv_module() -> Shared<Module> {
    let mut module = Module::new();
    module.set_native_fn("encode", |text: ImmutableString, encoding: ImmutableString| {
        encode_text(&text, &encoding)
    });
    module.set_native_fn("decode", |data: Blob, encoding: ImmutableString| {
        decode_bytes(&data, &encoding)
    });
    module.build_index();
    module.into()
}
