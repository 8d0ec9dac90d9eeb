//! The decryptor: invokes an external CENC decryption tool (`mp4decrypt`-compatible)
//! via temporary files, never via stdin/stdout. Piping cipher bytes through a subprocess's stdin
//! is a latent portability bug across `mp4decrypt` versions (the characteristic failure is
//! "cannot open input file (-) -4"); always going through file paths sidesteps it entirely, and
//! implementers should not "optimize" this back to pipes.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::DecryptionError;

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Decrypts `cipher_bytes` using the external `mp4decrypt`-compatible binary at `binary_path`,
/// given a map of KID (hex) -> key (hex). When `key_map` is empty the caller should not invoke
/// this at all: the decryptor is bypassed and bytes pass through unchanged.
pub async fn decrypt(
    binary_path: &str,
    key_map: &HashMap<String, String>,
    cipher_bytes: &Bytes,
) -> Result<Bytes, DecryptionError> {
    decrypt_with_timeout(binary_path, key_map, cipher_bytes, SUBPROCESS_TIMEOUT).await
}

async fn decrypt_with_timeout(
    binary_path: &str,
    key_map: &HashMap<String, String>,
    cipher_bytes: &Bytes,
    timeout: Duration,
) -> Result<Bytes, DecryptionError> {
    let input = tempfile::Builder::new()
        .prefix("dashhls-in")
        .suffix(".m4s")
        .tempfile()
        .map_err(|e| DecryptionError::Spawn {
            binary: binary_path.to_string(),
            source: e,
        })?;
    tokio::fs::write(input.path(), cipher_bytes)
        .await
        .map_err(|e| DecryptionError::Spawn {
            binary: binary_path.to_string(),
            source: e,
        })?;

    let output = tempfile::Builder::new()
        .prefix("dashhls-out")
        .suffix(".m4s")
        .tempfile()
        .map_err(|e| DecryptionError::Spawn {
            binary: binary_path.to_string(),
            source: e,
        })?;

    let mut args: Vec<String> = Vec::new();
    for (kid, key) in key_map {
        args.push("--key".to_string());
        args.push(format!("{kid}:{key}"));
    }
    args.push(input.path().to_string_lossy().to_string());
    args.push(output.path().to_string_lossy().to_string());

    info!("running {binary_path} {}", args.join(" "));

    let mut child = Command::new(binary_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DecryptionError::Spawn {
            binary: binary_path.to_string(),
            source: e,
        })?;

    let wait = tokio::time::timeout(timeout, child.wait());
    let status = match wait.await {
        Ok(status) => status.map_err(|e| DecryptionError::Spawn {
            binary: binary_path.to_string(),
            source: e,
        })?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(DecryptionError::Timeout {
                binary: binary_path.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    if !status.success() {
        let stderr_excerpt = read_excerpt(&mut child).await;
        error!("{binary_path} subprocess failed: {stderr_excerpt}");
        return Err(DecryptionError::ExitCode {
            binary: binary_path.to_string(),
            code: status.code(),
            stderr_excerpt,
        });
    }

    let bytes = tokio::fs::read(output.path())
        .await
        .map_err(|e| DecryptionError::Spawn {
            binary: binary_path.to_string(),
            source: e,
        })?;
    if bytes.is_empty() {
        warn!("{binary_path} produced empty output for {}", input.path().display());
        return Err(DecryptionError::EmptyOutput {
            binary: binary_path.to_string(),
            input: input.path().to_path_buf(),
        });
    }

    // `input` and `output` are `NamedTempFile`s: dropping them here deletes both paths on every
    // exit path above as well, success or failure, satisfying the "no residual temp files"
    // cleanup structurally rather than via manual bookkeeping.
    Ok(Bytes::from(bytes))
}

async fn read_excerpt(child: &mut tokio::process::Child) -> String {
    let mut buf = Vec::new();
    if let Some(stderr) = child.stderr.as_mut() {
        let _ = stderr.take(4096).read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    // Writes a tiny shell script standing in for `mp4decrypt`: it ignores the `--key` pairs and
    // just copies its last-but-one argument (input path) to its last argument (output path),
    // optionally truncating to zero bytes or exiting non-zero based on env var knobs the test
    // sets before invoking it.
    fn fake_binary(body: &str) -> tempfile::TempPath {
        let mut script = tempfile::Builder::new()
            .prefix("fake-mp4decrypt")
            .tempfile()
            .unwrap();
        use std::io::Write;
        writeln!(script, "#!/bin/sh\n{body}").unwrap();
        let path = script.into_temp_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn one_key() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert(
            "11223344556677889900aabbccddeeff".to_string(),
            "00112233445566778899aabbccddeeff".to_string(),
        );
        m
    }

    #[tokio::test]
    async fn successful_decryption_copies_input_to_output() {
        // Real argv is `--key kid:key ... <input> <output>`; drop the `--key` pairs and copy the
        // last two positional arguments.
        let bin = fake_binary(r#"shift $(($# - 2)); cp "$1" "$2""#);
        let result = decrypt(bin.to_str().unwrap(), &one_key(), &Bytes::from_static(b"cipher"))
            .await
            .unwrap();
        assert_eq!(result, Bytes::from_static(b"cipher"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr_excerpt() {
        let bin = fake_binary("echo 'bad key' >&2; exit 7");
        let err = decrypt(bin.to_str().unwrap(), &one_key(), &Bytes::from_static(b"cipher"))
            .await
            .unwrap_err();
        match err {
            DecryptionError::ExitCode { code, stderr_excerpt, .. } => {
                assert_eq!(code, Some(7));
                assert!(stderr_excerpt.contains("bad key"));
            }
            other => panic!("expected ExitCode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_output_with_zero_exit_is_reported() {
        let bin = fake_binary("exit 0");
        let err = decrypt(bin.to_str().unwrap(), &one_key(), &Bytes::from_static(b"cipher"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecryptionError::EmptyOutput { .. }));
    }

    #[tokio::test]
    async fn subprocess_exceeding_timeout_is_killed_and_reported() {
        let bin = fake_binary("sleep 5");
        let err = decrypt_with_timeout(
            bin.to_str().unwrap(),
            &one_key(),
            &Bytes::from_static(b"cipher"),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecryptionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn temp_files_are_cleaned_up_after_failure() {
        let before = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("dashhls-"))
            .count();
        let bin = fake_binary("exit 1");
        for _ in 0..5 {
            let _ = decrypt(bin.to_str().unwrap(), &one_key(), &Bytes::from_static(b"cipher")).await;
        }
        let after = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("dashhls-"))
            .count();
        assert_eq!(before, after, "no dashhls- temp files should remain after repeated failures");
    }
}
