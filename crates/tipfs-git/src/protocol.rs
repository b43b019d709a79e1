//! Git smart protocol, fetch side.
//!
//! Covers the ref advertisement a server sends first, the request a client
//! sends back, and the server-side counterparts used by test remotes.
//! See: https://git-scm.com/docs/http-protocol

use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::{GitError, HashAlgorithm, ObjectId, Result};
use std::fmt;
use std::io::Write;
use tokio::io::AsyncRead;
use tracing::trace;

/// Name the server gives the capability line of an empty repository.
const EMPTY_REPO_REF: &str = "capabilities^{}";
/// Suffix of a peeled tag entry.
const PEELED_SUFFIX: &str = "^{}";

/// Server capabilities from the first advertised ref line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Hash algorithm for every object id in the session.
    pub object_format: HashAlgorithm,
    /// Whether the server accepts `filter` (partial clone).
    pub filter: bool,
    /// Target of the `HEAD` symref, when advertised.
    pub symref_head: Option<String>,
    /// Server agent string, when advertised.
    pub agent: Option<String>,
    /// Every capability token, in advertised order.
    pub raw: Vec<String>,
}

impl ServerCapabilities {
    /// Creates a capability set advertising only the object format and,
    /// optionally, filter support.
    pub fn new(object_format: HashAlgorithm, filter: bool) -> Self {
        let mut raw = vec![format!("object-format={}", object_format)];
        if filter {
            raw.push("filter".to_string());
        }
        Self {
            object_format,
            filter,
            symref_head: None,
            agent: None,
            raw,
        }
    }

    /// Adds a `symref=HEAD:<target>` capability.
    pub fn with_symref_head(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        self.raw.push(format!("symref=HEAD:{}", target));
        self.symref_head = Some(target);
        self
    }

    /// Adds an `agent=<agent>` capability.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        let agent = agent.into();
        self.raw.push(format!("agent={}", agent));
        self.agent = Some(agent);
        self
    }

    /// Parses the space separated capability list.
    ///
    /// A missing `object-format` means SHA-1.
    pub fn parse(list: &str) -> Result<Self> {
        let mut caps = Self {
            object_format: HashAlgorithm::Sha1,
            filter: false,
            symref_head: None,
            agent: None,
            raw: Vec::new(),
        };

        for token in list.split_whitespace() {
            if let Some(format) = token.strip_prefix("object-format=") {
                caps.object_format = HashAlgorithm::parse(format).ok_or_else(|| {
                    GitError::Protocol(format!("unsupported object-format {:?}", format))
                })?;
            } else if token == "filter" {
                caps.filter = true;
            } else if let Some(target) = token.strip_prefix("symref=HEAD:") {
                caps.symref_head = Some(target.to_string());
            } else if let Some(agent) = token.strip_prefix("agent=") {
                caps.agent = Some(agent.to_string());
            }
            caps.raw.push(token.to_string());
        }

        Ok(caps)
    }

    /// Returns true if the named capability was advertised.
    pub fn has(&self, name: &str) -> bool {
        self.raw
            .iter()
            .any(|token| token == name || token.split_once('=').map(|(k, _)| k) == Some(name))
    }
}

impl fmt::Display for ServerCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw.join(" "))
    }
}

/// A reference advertisement line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRef {
    /// Object ID the ref points to.
    pub id: ObjectId,
    /// Reference name.
    pub name: String,
}

impl AdvertisedRef {
    /// Creates an advertised ref.
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Everything a server advertises before negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefAdvertisement {
    /// Capabilities from the first ref line.
    pub capabilities: ServerCapabilities,
    /// Refs in advertised order. The first is normally `HEAD`.
    pub refs: Vec<AdvertisedRef>,
}

impl RefAdvertisement {
    /// Reads an advertisement up to the flush that ends its ref list.
    ///
    /// `# service=` banners, empty lines and a flush before the first ref
    /// are skipped.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut PktLineReader<R>) -> Result<Self> {
        let mut capabilities: Option<ServerCapabilities> = None;
        let mut refs = Vec::new();

        loop {
            let pkt = match reader.read().await? {
                Some(PktLine::Flush) if capabilities.is_some() => break,
                Some(PktLine::Flush) => continue,
                Some(pkt) => pkt,
                None => break,
            };
            if let Some(message) = pkt.error_message() {
                return Err(GitError::Remote(message));
            }
            let data = pkt.data().unwrap_or_default();
            let line = String::from_utf8_lossy(data);
            let line = line.trim_end_matches('\n');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (ref_line, algorithm) = match &capabilities {
                Some(caps) => (line, caps.object_format),
                None => {
                    let (ref_line, list) = line.split_once('\0').ok_or_else(|| {
                        GitError::Protocol(format!(
                            "expected capability list after first ref, found {:?}",
                            line
                        ))
                    })?;
                    let caps = ServerCapabilities::parse(list)?;
                    let algorithm = caps.object_format;
                    capabilities = Some(caps);
                    (ref_line, algorithm)
                }
            };

            let advertised = parse_ref_line(algorithm, ref_line)?;
            if advertised.name == EMPTY_REPO_REF {
                continue;
            }
            refs.push(advertised);
        }

        let capabilities = capabilities.ok_or_else(|| {
            GitError::Protocol("advertisement ended before the first ref line".to_string())
        })?;
        trace!(refs = refs.len(), format = %capabilities.object_format, "read ref advertisement");
        Ok(Self { capabilities, refs })
    }

    /// Hash algorithm of the session.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.capabilities.object_format
    }

    /// Looks up a ref by its exact name.
    pub fn find(&self, name: &str) -> Option<ObjectId> {
        self.refs.iter().find(|r| r.name == name).map(|r| r.id)
    }

    /// Resolves a configured reference to the commit to fetch.
    ///
    /// An empty reference picks the first advertised ref. A full-length hex
    /// string is taken as the commit id itself, even when no ref names it;
    /// the advertisement is not consulted and the first advertised oid is
    /// not substituted. Otherwise the name is tried as given, then under
    /// `refs/heads/`, then under `refs/tags/`; a peeled `^{}` entry wins over
    /// the ref it belongs to.
    pub fn resolve(&self, reference: &str) -> Option<ObjectId> {
        if reference.is_empty() {
            return self.refs.first().map(|r| r.id);
        }
        if ObjectId::is_hex(self.algorithm(), reference) {
            return ObjectId::from_hex_with(self.algorithm(), reference).ok();
        }

        let candidates = [
            reference.to_string(),
            format!("refs/heads/{}", reference),
            format!("refs/tags/{}", reference),
        ];
        candidates.iter().find_map(|name| {
            self.find(&format!("{}{}", name, PEELED_SUFFIX))
                .or_else(|| self.find(name))
        })
    }
}

fn parse_ref_line(algorithm: HashAlgorithm, line: &str) -> Result<AdvertisedRef> {
    let malformed = || GitError::Protocol(format!("malformed ref line {:?}", line));
    let (hex, name) = line.split_once(' ').ok_or_else(malformed)?;
    if name.is_empty() || !ObjectId::is_hex(algorithm, hex) {
        return Err(malformed());
    }
    let id = ObjectId::from_hex_with(algorithm, hex).map_err(|_| malformed())?;
    Ok(AdvertisedRef::new(id, name))
}

/// The want/deepen/filter request sent to upload-pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Object to fetch.
    pub want: ObjectId,
    /// History depth, if shallow.
    pub depth: Option<u32>,
    /// Ask the server to leave blob bodies out.
    pub filter: bool,
}

impl FetchRequest {
    /// Requests the tip commit and its trees at depth 1.
    pub fn shallow(want: ObjectId, filter: bool) -> Self {
        Self {
            want,
            depth: Some(1),
            filter,
        }
    }

    /// Requests a single object.
    pub fn object(want: ObjectId) -> Self {
        Self {
            want,
            depth: None,
            filter: false,
        }
    }

    /// Encodes the request as pkt-lines.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = PktLineWriter::new(Vec::new());
        if self.filter {
            writer.write_line(&format!("want {} filter", self.want))?;
        } else {
            writer.write_line(&format!("want {}", self.want))?;
        }
        if let Some(depth) = self.depth {
            writer.write_line(&format!("deepen {}", depth))?;
        }
        if self.filter {
            writer.write_line("filter blob:none")?;
        }
        writer.flush_pkt()?;
        writer.write_line("done")?;
        Ok(writer.into_inner())
    }
}

/// Writes a ref advertisement, as a server would.
///
/// `service` adds the smart-HTTP `# service=<name>` banner and its flush.
pub fn write_advertisement<W: Write>(
    writer: &mut W,
    refs: &[AdvertisedRef],
    capabilities: &ServerCapabilities,
    service: Option<&str>,
) -> Result<()> {
    let mut pkt_writer = PktLineWriter::new(writer);

    if let Some(service) = service {
        pkt_writer.write_line(&format!("# service={}", service))?;
        pkt_writer.flush_pkt()?;
    }

    // First line includes capabilities
    let first_ref = match refs.first() {
        Some(first) => format!("{} {}\0{}\n", first.id, first.name, capabilities),
        // Empty repo - use zero ID
        None => format!(
            "{} {}\0{}\n",
            capabilities.object_format.null_id(),
            EMPTY_REPO_REF,
            capabilities
        ),
    };
    pkt_writer.write(&PktLine::from_string(&first_ref))?;

    for advertised in refs.iter().skip(1) {
        pkt_writer.write_line(&format!("{} {}", advertised.id, advertised.name))?;
    }

    pkt_writer.flush_pkt()?;
    pkt_writer.flush()?;
    Ok(())
}

/// A client request as received by upload-pack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    /// Object IDs the client wants.
    pub wants: Vec<ObjectId>,
    /// Capabilities listed on the first want line.
    pub capabilities: Vec<String>,
    /// Requested `deepen` depth.
    pub depth: Option<u32>,
    /// Requested filter spec.
    pub filter: Option<String>,
    /// Object IDs the client has (for delta compression).
    pub haves: Vec<ObjectId>,
    /// Whether the client sent `done`.
    pub done: bool,
}

impl UploadRequest {
    /// Parses want/have lines from the client.
    pub async fn parse<R: AsyncRead + Unpin>(reader: R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut request = Self::default();

        loop {
            let pkt = match pkt_reader.read().await? {
                Some(PktLine::Flush) => continue,
                Some(pkt) => pkt,
                None => break,
            };
            let line = pkt.as_str().unwrap_or_default().trim();

            if let Some(rest) = line.strip_prefix("want ") {
                let mut parts = rest.split(' ');
                let hex = parts.next().unwrap_or_default();
                request.wants.push(ObjectId::from_hex(hex)?);
                if request.wants.len() == 1 {
                    request.capabilities = parts.map(str::to_string).collect();
                }
            } else if let Some(hex) = line.strip_prefix("have ") {
                request.haves.push(ObjectId::from_hex(hex)?);
            } else if let Some(depth) = line.strip_prefix("deepen ") {
                request.depth = Some(depth.parse().map_err(|_| {
                    GitError::Protocol(format!("invalid deepen value {:?}", depth))
                })?);
            } else if let Some(spec) = line.strip_prefix("filter ") {
                request.filter = Some(spec.to_string());
            } else if line == "done" {
                request.done = true;
                break;
            } else {
                trace!(line, "ignoring request line");
            }
        }

        Ok(request)
    }
}
