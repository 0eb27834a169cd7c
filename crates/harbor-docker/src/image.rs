//! Base image definition for Harbor sandboxes.

/// Dockerfile for the sandbox base image.
///
/// node for the Assistant CLI itself, python3 for the bridge program the
/// broker copies in at startup, and a non-root user that owns the app tree.
pub fn sandbox_dockerfile() -> String {
    r#"FROM node:20-alpine

RUN apk add --no-cache \
    bash \
    curl \
    git \
    python3

RUN npm install -g @openai/codex

RUN addgroup -g 1001 codex && \
    adduser -D -u 1001 -G codex codex

RUN mkdir -p /app/workspace /app/config && \
    chown -R codex:codex /app

USER codex
WORKDIR /app

ENV PATH="/usr/local/bin:$PATH"

HEALTHCHECK --interval=30s --timeout=10s --start-period=5s --retries=3 \
    CMD codex --version || exit 1

CMD ["tail", "-f", "/dev/null"]
"#
    .to_string()
}

/// Pack a single-file build context (the Dockerfile) into a tar archive the
/// engine's build endpoint accepts.
pub(crate) fn dockerfile_tar(dockerfile: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let bytes = dockerfile.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_path("Dockerfile")?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)?;

    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_installs_assistant_and_bridge_runtime() {
        let df = sandbox_dockerfile();
        assert!(df.contains("npm install -g @openai/codex"));
        assert!(df.contains("python3"));
        assert!(df.contains("USER codex"));
    }

    #[test]
    fn build_context_is_a_valid_tar_with_dockerfile() {
        let df = sandbox_dockerfile();
        let archive = dockerfile_tar(&df).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "Dockerfile");
        assert_eq!(entry.size(), df.len() as u64);
    }
}
