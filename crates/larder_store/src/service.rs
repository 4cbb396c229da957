//! Adding implementations to a shared store through a privileged service.
//!
//! A system-wide store is usually not writable by ordinary users. Instead a service running with
//! the required rights listens on a Unix domain socket and adds implementations on their behalf.
//! Because the service builds and verifies everything itself, a client can only ever cause content
//! to be stored that matches the digest it asked for.
//!
//! The service reads the files named in a recipe on behalf of the connected user. It identifies
//! that user from the socket's peer credentials and only opens regular files the user could have
//! read themselves; everything else is refused with the same error, whether the file exists or
//! not.
//!
//! The protocol is line based: each request and each response is a single JSON object followed by
//! a newline. A connection may carry any number of requests.
//!
//! ```text
//! {"request":"contains","digest":{"sha256":"4927…"}}
//! {"response":"contains","present":false}
//! ```

use std::{
    io::{BufRead, BufReader, ErrorKind, Write},
    os::unix::{
        fs::{MetadataExt, OpenOptionsExt, PermissionsExt},
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use fs_err as fs;
use larder_build::{
    BuildAction, BuildContext, BuildError, Recipe, SilentTaskHandler, TaskHandler,
};
use larder_manifest::ManifestDigest;
use serde::{Deserialize, Serialize};

use crate::{DigestMismatch, DirectoryStore, ImplementationStore, StoreError, StoreKind};

/// A request sent to a [`StoreService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ServiceRequest {
    /// Build `recipe` and add the result as `digest`.
    Add {
        /// The expected digest.
        digest: ManifestDigest,
        /// How to build the implementation.
        recipe: Recipe,
    },
    /// Check whether `digest` is stored.
    Contains {
        /// The digest to look for.
        digest: ManifestDigest,
    },
    /// Look up the directory of `digest`.
    GetPath {
        /// The digest to look for.
        digest: ManifestDigest,
    },
}

/// The answer of a [`StoreService`] to a [`ServiceRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ServiceResponse {
    /// The implementation was added.
    Added {
        /// Where it is stored.
        path: PathBuf,
    },
    /// Answers [`ServiceRequest::Contains`].
    Contains {
        /// Whether the implementation is stored.
        present: bool,
    },
    /// Answers [`ServiceRequest::GetPath`].
    Path {
        /// The directory, if the implementation is stored.
        path: Option<PathBuf>,
    },
    /// The request failed.
    Error {
        /// What kind of error occurred.
        kind: ServiceErrorKind,
        /// A description of the error.
        message: String,
        /// For [`ServiceErrorKind::DigestMismatch`], the id of the digest that was computed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actual: Option<String>,
    },
}

/// The kind of a failed request, mirroring the variants of [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    /// See [`StoreError::AlreadyInStore`].
    AlreadyInStore,
    /// See [`StoreError::NotFound`].
    NotFound,
    /// See [`StoreError::DigestMismatch`].
    DigestMismatch,
    /// See [`StoreError::NotAdmin`].
    NotAdmin,
    /// See [`StoreError::Unauthorized`].
    Unauthorized,
    /// See [`StoreError::NotSupported`].
    NotSupported,
    /// See [`StoreError::Cancelled`].
    Cancelled,
    /// Any other failure.
    Failed,
}

impl ServiceResponse {
    fn from_error(error: &StoreError) -> Self {
        let (kind, actual) = match error {
            StoreError::AlreadyInStore(_) => (ServiceErrorKind::AlreadyInStore, None),
            StoreError::NotFound(_) => (ServiceErrorKind::NotFound, None),
            StoreError::DigestMismatch(mismatch) => {
                (ServiceErrorKind::DigestMismatch, Some(mismatch.actual.clone()))
            }
            StoreError::NotAdmin(_) => (ServiceErrorKind::NotAdmin, None),
            StoreError::Unauthorized(..) => (ServiceErrorKind::Unauthorized, None),
            StoreError::NotSupported(_) => (ServiceErrorKind::NotSupported, None),
            StoreError::Cancelled => (ServiceErrorKind::Cancelled, None),
            _ => (ServiceErrorKind::Failed, None),
        };
        ServiceResponse::Error {
            kind,
            message: error.to_string(),
            actual,
        }
    }

    fn into_error(self, digest: &ManifestDigest, root: &Path) -> StoreError {
        let (kind, message, actual) = match self {
            ServiceResponse::Error {
                kind,
                message,
                actual,
            } => (kind, message, actual),
            other => return StoreError::Service(format!("unexpected response {other:?}")),
        };
        match kind {
            ServiceErrorKind::AlreadyInStore => StoreError::AlreadyInStore(digest.clone()),
            ServiceErrorKind::NotFound => StoreError::NotFound(digest.clone()),
            ServiceErrorKind::DigestMismatch => DigestMismatch {
                expected: digest.clone(),
                actual: actual.unwrap_or_default(),
                expected_manifest: None,
                actual_manifest: None,
            }
            .into(),
            ServiceErrorKind::NotAdmin => StoreError::NotAdmin(root.to_path_buf()),
            ServiceErrorKind::Unauthorized => StoreError::Unauthorized(
                message.clone(),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, message),
            ),
            ServiceErrorKind::NotSupported => StoreError::NotSupported(message),
            ServiceErrorKind::Cancelled => StoreError::Cancelled,
            ServiceErrorKind::Failed => StoreError::Service(message),
        }
    }
}

/// Sends requests to a [`StoreService`].
#[derive(Debug, Clone)]
pub struct ServiceClient {
    socket: PathBuf,
}

impl ServiceClient {
    /// Creates a client for the service listening on `socket`. No connection is made yet.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// The socket of the service.
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sends a single request on a new connection and waits for the response.
    pub fn send(&self, request: &ServiceRequest) -> Result<ServiceResponse, StoreError> {
        let service_error = |e: std::io::Error| {
            StoreError::Service(format!(
                "failed to talk to the store service at '{}': {e}",
                self.socket.display()
            ))
        };
        let mut stream = UnixStream::connect(&self.socket).map_err(service_error)?;

        let mut line = serde_json::to_string(request)
            .map_err(|e| StoreError::Service(format!("failed to encode request: {e}")))?;
        line.push('\n');
        stream.write_all(line.as_bytes()).map_err(service_error)?;
        stream.flush().map_err(service_error)?;

        let mut response = String::new();
        BufReader::new(&stream)
            .read_line(&mut response)
            .map_err(service_error)?;
        serde_json::from_str(&response).map_err(|e| {
            StoreError::Service(format!("invalid response from the store service: {e}"))
        })
    }

    /// Asks whether `digest` is stored.
    pub fn contains(&self, digest: &ManifestDigest) -> Result<bool, StoreError> {
        match self.send(&ServiceRequest::Contains {
            digest: digest.clone(),
        })? {
            ServiceResponse::Contains { present } => Ok(present),
            other => Err(other.into_error(digest, &self.socket)),
        }
    }

    /// Asks for the directory of `digest`.
    pub fn get_path(&self, digest: &ManifestDigest) -> Result<Option<PathBuf>, StoreError> {
        match self.send(&ServiceRequest::GetPath {
            digest: digest.clone(),
        })? {
            ServiceResponse::Path { path } => Ok(path),
            other => Err(other.into_error(digest, &self.socket)),
        }
    }
}

/// A store whose additions are performed by a [`StoreService`].
///
/// Everything except adding is answered from the store directory directly, which ordinary users
/// can read but not modify.
pub struct ServiceStore {
    client: ServiceClient,
    local: DirectoryStore,
}

impl ServiceStore {
    /// Creates a store that sends additions to the service on `socket` and reads from `root`.
    pub fn new(socket: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            client: ServiceClient::new(socket),
            local: DirectoryStore::open_read_only(root),
        }
    }

    /// The client used to talk to the service.
    pub fn client(&self) -> &ServiceClient {
        &self.client
    }
}

impl ImplementationStore for ServiceStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Service
    }

    fn path(&self) -> Option<&Path> {
        Some(self.local.root())
    }

    fn contains(&self, digest: &ManifestDigest) -> bool {
        self.local.contains(digest)
    }

    fn get_path(&self, digest: &ManifestDigest) -> Option<PathBuf> {
        self.local.get_path(digest)
    }

    fn list_all(&self) -> Result<Vec<ManifestDigest>, StoreError> {
        self.local.list_all()
    }

    fn list_temp(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.local.list_temp()
    }

    fn add(
        &self,
        digest: &ManifestDigest,
        action: &dyn BuildAction,
        _context: &BuildContext<'_>,
    ) -> Result<PathBuf, StoreError> {
        let Some(recipe) = action.recipe() else {
            return Err(StoreError::NotSupported(
                "only recipes can be added through the store service".to_string(),
            ));
        };
        tracing::debug!("asking the store service to add {digest}");
        match self.client.send(&ServiceRequest::Add {
            digest: digest.clone(),
            recipe: recipe.clone(),
        })? {
            ServiceResponse::Added { path } => Ok(path),
            other => Err(other.into_error(digest, self.local.root())),
        }
    }

    fn verify(&self, digest: &ManifestDigest, handler: &dyn TaskHandler) -> Result<(), StoreError> {
        self.local.verify(digest, handler)
    }

    fn remove(&self, _digest: &ManifestDigest, _handler: &dyn TaskHandler) -> Result<bool, StoreError> {
        Err(StoreError::NotAdmin(self.local.root().to_path_buf()))
    }

    fn purge(&self, _handler: &dyn TaskHandler) -> Result<(), StoreError> {
        Err(StoreError::NotAdmin(self.local.root().to_path_buf()))
    }

    fn optimise(&self, _handler: &dyn TaskHandler) -> Result<u64, StoreError> {
        Err(StoreError::NotAdmin(self.local.root().to_path_buf()))
    }
}

/// The user on the other end of a service connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    /// The user id of the peer.
    pub uid: u32,
    /// The primary and supplementary groups of the peer.
    pub groups: Vec<u32>,
}

impl PeerCredentials {
    /// Reads the credentials of the process connected to `stream`.
    pub fn from_stream(stream: &UnixStream) -> std::io::Result<Self> {
        let (uid, gid) = peer_ids(stream)?;
        Ok(Self {
            uid,
            groups: groups_of(uid, gid),
        })
    }

    /// Returns true if the peer may read the file described by `metadata`.
    pub fn can_read(&self, metadata: &std::fs::Metadata) -> bool {
        self.has_access(metadata, 0o4)
    }

    /// Returns true if the peer may look up entries of the directory described by `metadata`.
    pub fn can_search(&self, metadata: &std::fs::Metadata) -> bool {
        self.has_access(metadata, 0o1)
    }

    fn has_access(&self, metadata: &std::fs::Metadata, bits: u32) -> bool {
        if self.uid == 0 {
            return true;
        }
        let mode = metadata.mode();
        if metadata.uid() == self.uid {
            mode & (bits << 6) != 0
        } else if self.groups.contains(&metadata.gid()) {
            mode & (bits << 3) != 0
        } else {
            mode & bits != 0
        }
    }

    /// Opens `path` for reading if this peer could read it. Missing and inaccessible files are
    /// reported alike; files that are not regular files are refused.
    pub fn open(&self, path: &Path) -> Result<fs::File, BuildError> {
        let denied = || {
            BuildError::IoError(
                format!("open '{}'", path.display()),
                std::io::Error::new(ErrorKind::PermissionDenied, "not readable by the client"),
            )
        };
        if !path.is_absolute() {
            return Err(denied());
        }
        let canonical = std::fs::canonicalize(path).map_err(|_| denied())?;
        for ancestor in canonical.ancestors().skip(1) {
            let metadata = std::fs::metadata(ancestor).map_err(|_| denied())?;
            if !self.can_search(&metadata) {
                return Err(denied());
            }
        }

        // Non-blocking so that opening a FIFO cannot stall the service.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
            .open(&canonical)
            .map_err(|_| denied())?;
        let metadata = file.metadata().map_err(|_| denied())?;
        if !self.can_read(&metadata) {
            return Err(denied());
        }
        if !metadata.is_file() {
            return Err(BuildError::IoError(
                format!("open '{}'", path.display()),
                std::io::Error::new(ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        Ok(fs::File::from_parts(file, canonical))
    }
}

#[cfg(target_os = "linux")]
fn peer_ids(stream: &UnixStream) -> std::io::Result<(u32, u32)> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if result == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((cred.uid, cred.gid))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn peer_ids(stream: &UnixStream) -> std::io::Result<(u32, u32)> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let result = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((uid, gid))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
fn peer_ids(stream: &UnixStream) -> std::io::Result<(u32, u32)> {
    let _ = stream.as_raw_fd();
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "peer credentials are not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn groups_of(uid: u32, gid: u32) -> Vec<u32> {
    let mut buffer = vec![0 as libc::c_char; 16 * 1024];
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut entry: *mut libc::passwd = std::ptr::null_mut();
    let result = unsafe {
        libc::getpwuid_r(
            uid,
            &mut passwd,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut entry,
        )
    };
    if result != 0 || entry.is_null() {
        return vec![gid];
    }

    let mut groups: Vec<libc::gid_t> = vec![0; 256];
    let mut count = groups.len() as libc::c_int;
    let result =
        unsafe { libc::getgrouplist(passwd.pw_name, gid, groups.as_mut_ptr(), &mut count) };
    if result < 0 {
        return vec![gid];
    }
    groups.truncate(count as usize);
    groups
}

// Only the primary group is known here, which can refuse files the peer could read.
#[cfg(not(target_os = "linux"))]
fn groups_of(_uid: u32, gid: u32) -> Vec<u32> {
    vec![gid]
}

/// Serves [`ServiceRequest`]s against a [`DirectoryStore`].
pub struct StoreService {
    store: Arc<DirectoryStore>,
}

impl StoreService {
    /// Creates a service for `store`.
    pub fn new(store: Arc<DirectoryStore>) -> Self {
        Self { store }
    }

    /// Binds a listening socket at `path`, replacing a stale socket file, and makes it accessible
    /// to all local users.
    pub fn bind(path: &Path) -> Result<UnixListener, StoreError> {
        if path.exists() {
            fs::remove_file(path)
                .map_err(|e| StoreError::io(format!("remove stale socket '{}'", path.display()), e))?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(format!("create '{}'", parent.display()), e))?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| StoreError::io(format!("bind socket '{}'", path.display()), e))?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).map_err(|e| {
            StoreError::io(format!("set permissions of '{}'", path.display()), e)
        })?;
        tracing::info!("listening on {}", path.display());
        Ok(listener)
    }

    /// Accepts connections until the listener fails, handling each on its own thread.
    pub fn serve(&self, listener: UnixListener) -> Result<(), StoreError> {
        for stream in listener.incoming() {
            let stream = stream.map_err(|e| StoreError::io("accept a connection", e))?;
            let store = self.store.clone();
            std::thread::spawn(move || {
                if let Err(e) = handle_connection(&store, &stream) {
                    tracing::warn!("store service connection failed: {e}");
                }
            });
        }
        Ok(())
    }
}

fn handle_connection(store: &DirectoryStore, stream: &UnixStream) -> std::io::Result<()> {
    let peer = match PeerCredentials::from_stream(stream) {
        Ok(peer) => Some(peer),
        Err(e) => {
            tracing::warn!("cannot identify the client of the store service: {e}");
            None
        }
    };
    let mut writer = stream;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ServiceRequest>(&line) {
            Ok(request) => handle_request(store, request, peer.as_ref()),
            Err(e) => ServiceResponse::from_error(&StoreError::NotSupported(format!(
                "invalid request: {e}"
            ))),
        };
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes())?;
        writer.flush()?;
    }
    Ok(())
}

fn handle_request(
    store: &DirectoryStore,
    request: ServiceRequest,
    peer: Option<&PeerCredentials>,
) -> ServiceResponse {
    match request {
        ServiceRequest::Add { digest, recipe } => {
            let Some(peer) = peer else {
                return ServiceResponse::from_error(&StoreError::Unauthorized(
                    "identify the client".to_string(),
                    std::io::Error::new(ErrorKind::PermissionDenied, "unknown peer"),
                ));
            };
            tracing::info!("adding {digest} on behalf of uid {}", peer.uid);
            let handler = SilentTaskHandler::new();
            let lookup = |digest: &ManifestDigest| store.get_path(digest);
            let opener = |path: &Path| peer.open(path);
            let context = BuildContext::new(&handler)
                .with_implementation_lookup(&lookup)
                .with_source_opener(&opener);
            match store.add(&digest, &recipe, &context) {
                Ok(path) => ServiceResponse::Added { path },
                Err(e) => {
                    tracing::warn!("failed to add {digest}: {e}");
                    ServiceResponse::from_error(&e)
                }
            }
        }
        ServiceRequest::Contains { digest } => ServiceResponse::Contains {
            present: store.contains(&digest),
        },
        ServiceRequest::GetPath { digest } => ServiceResponse::Path {
            path: store.get_path(&digest),
        },
    }
}
