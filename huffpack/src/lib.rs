use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use huffpack_huffman::{build_code_book, BitWriter, ByteHistogram, CodeBook, HuffmanError};
use thiserror::Error;
use tracing::{info, warn};

pub const ARCHIVE_SUFFIX: &str = ".compressed";

const READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;
const WRITE_BUFFER_SIZE: usize = 8 * 1024 * 1024;
const OUTPUT_ESTIMATE_DIVISOR: u64 = 4;

// Nominal size charged per directory in the user-facing total.
const DIRECTORY_WEIGHT: u64 = 4096;

// Bit-budget contributions of the fixed record fields.
const FILE_SIZE_FIELD_BITS: u64 = 64;
const CHILD_COUNT_FIELD_BITS: u64 = 16;
const ENTRY_OVERHEAD_BITS: u64 = 9; // marker bit + 8-bit name length

const MAX_PASSWORD_LEN: usize = 100;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no input paths were given")]
    MissingInputs,
    #[error("input does not exist: {0}")]
    MissingInputFile(PathBuf),
    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),
    #[error("too many top-level inputs for a 16-bit file count")]
    TooManyInputs,
    #[error("too many entries for a 16-bit child count in {0}")]
    TooManyChildren(PathBuf),
    #[error("entry name is longer than {MAX_NAME_LEN} bytes: {0}")]
    NameTooLong(PathBuf),
    #[error("entry name is not valid utf-8: {0}")]
    NonUtf8Name(PathBuf),
    #[error("cannot read {path}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("huffman error: {0}")]
    Huffman(#[from] HuffmanError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Order in which the encoded top-level records are concatenated into the
/// archive body. `ByWorker` appends each worker's records as a group,
/// ordered by worker index. `ByInput` orders records by their position on
/// the command line, independent of scheduling; the two layouts are not
/// byte-compatible with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatOrder {
    ByWorker,
    ByInput,
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub password: Option<String>,
    /// Worker thread count; `0` uses every available core.
    pub workers: usize,
    pub concat_order: ConcatOrder,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            password: None,
            workers: 0,
            concat_order: ConcatOrder::ByWorker,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveStats {
    /// Top-level records actually written (unreadable inputs are elided).
    pub entries: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub estimated_bytes: u64,
}

/// Receives the number of input bytes each worker has finished encoding.
/// The total to expect is [`ArchivePlan::root_weight`].
pub trait ProgressObserver: Send + Sync {
    fn advance(&self, bytes: u64);
}

#[derive(Debug, Clone)]
pub struct ArchivePlan {
    code_book: CodeBook,
    input_bytes: u64,
    estimated_bits: u64,
    file_count: u16,
}

impl ArchivePlan {
    pub fn code_book(&self) -> &CodeBook {
        &self.code_book
    }

    pub fn input_bytes(&self) -> u64 {
        self.input_bytes
    }

    pub fn estimated_bits(&self) -> u64 {
        self.estimated_bits
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.estimated_bits.div_ceil(8)
    }

    pub fn file_count(&self) -> u16 {
        self.file_count
    }

    /// Total symbol occurrences counted during analysis; the progress ceiling.
    pub fn root_weight(&self) -> u64 {
        self.code_book.root_weight()
    }
}

#[derive(Clone)]
pub struct Archiver {
    options: ArchiveOptions,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl Archiver {
    pub fn init(options: ArchiveOptions) -> Result<Self, ArchiveError> {
        if let Some(password) = options.password.as_deref() {
            validate_password(password)?;
        }
        Ok(Self {
            options,
            progress: None,
        })
    }

    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Pass 0 and pass 1: validates the inputs, collects the byte histogram
    /// in parallel and derives the code book plus the size estimate.
    pub fn analyze(&self, inputs: &[String]) -> Result<ArchivePlan, ArchiveError> {
        if inputs.is_empty() {
            return Err(ArchiveError::MissingInputs);
        }
        let file_count =
            u16::try_from(inputs.len()).map_err(|_| ArchiveError::TooManyInputs)?;
        for input in inputs {
            if fs::metadata(Path::new(input)).is_err() {
                return Err(ArchiveError::MissingInputFile(PathBuf::from(input)));
            }
        }

        let workers = self.worker_count(inputs.len());
        let collected = collect_frequencies(inputs, workers);
        let code_book = build_code_book(&collected.histogram)?;

        // 2-byte file count plus marker/name-length overhead per top-level
        // input, charged once here rather than inside the walker.
        let fixed_bits = 16 + ENTRY_OVERHEAD_BITS * inputs.len() as u64;
        let password_bits = match self.options.password.as_deref() {
            Some(password) => 8 + 8 * password.len() as u64,
            None => 8,
        };
        let estimated_bits = fixed_bits
            + collected.bit_budget
            + 8 // letter count byte
            + password_bits
            + code_book.table_bits()
            + code_book.payload_bits();

        Ok(ArchivePlan {
            code_book,
            input_bytes: collected.total_size,
            estimated_bits,
            file_count,
        })
    }

    /// Pass 2: encodes every top-level input in parallel and writes the
    /// archive. The partial output file is removed on failure.
    pub fn write_archive(
        &self,
        plan: &ArchivePlan,
        inputs: &[String],
        output_path: &Path,
    ) -> Result<ArchiveStats, ArchiveError> {
        if inputs.is_empty() {
            return Err(ArchiveError::MissingInputs);
        }
        if usize::from(plan.file_count) != inputs.len() {
            return Err(ArchiveError::Internal("plan does not match the input list"));
        }

        let workers = self.worker_count(inputs.len());
        let encoded = encode_payloads(
            inputs,
            &plan.code_book,
            workers,
            self.progress.as_deref(),
        )?;

        let mut payloads: Vec<(usize, Vec<u8>)> = Vec::with_capacity(inputs.len());
        for output in encoded {
            payloads.extend(output.produced);
        }
        if self.options.concat_order == ConcatOrder::ByInput {
            payloads.sort_by_key(|(index, _)| *index);
        }

        let header = encode_header(
            &plan.code_book,
            self.options.password.as_deref(),
            plan.file_count,
        )?;

        let entries = payloads.len();
        let result = write_output(output_path, &header, &payloads);
        let output_bytes = match result {
            Ok(bytes) => bytes,
            Err(error) => {
                let _ = fs::remove_file(output_path);
                return Err(error);
            }
        };

        info!(
            entries,
            output_bytes,
            output = %output_path.display(),
            "archive written"
        );

        Ok(ArchiveStats {
            entries,
            input_bytes: plan.input_bytes,
            output_bytes,
            estimated_bytes: plan.estimated_bytes(),
        })
    }

    pub fn compress(
        &self,
        inputs: &[String],
        output_path: &Path,
    ) -> Result<ArchiveStats, ArchiveError> {
        let plan = self.analyze(inputs)?;
        self.write_archive(&plan, inputs, output_path)
    }

    fn worker_count(&self, input_count: usize) -> usize {
        let available = if self.options.workers > 0 {
            self.options.workers
        } else {
            std::thread::available_parallelism()
                .map(|value| value.get())
                .unwrap_or(1)
        };
        available.min(input_count).max(1)
    }
}

pub fn default_output_path(first_input: &str) -> PathBuf {
    PathBuf::from(format!("{first_input}{ARCHIVE_SUFFIX}"))
}

fn validate_password(password: &str) -> Result<(), ArchiveError> {
    if password.is_empty() {
        return Err(ArchiveError::InvalidPassword("must not be empty"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(ArchiveError::InvalidPassword(
            "must not be longer than 100 characters",
        ));
    }
    if password.chars().any(char::is_whitespace) {
        return Err(ArchiveError::InvalidPassword("must not contain whitespace"));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out shrinking index ranges: every grab takes half of what is left
/// divided across the workers, so early grabs are large and the tail is
/// balanced one item at a time.
struct GuidedQueue {
    next: AtomicUsize,
    total: usize,
    workers: usize,
}

impl GuidedQueue {
    fn new(total: usize, workers: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            total,
            workers: workers.max(1),
        }
    }

    fn take(&self) -> Option<std::ops::Range<usize>> {
        let mut start = self.next.load(Ordering::Acquire);
        loop {
            if start >= self.total {
                return None;
            }
            let remaining = self.total - start;
            let chunk = (remaining / (2 * self.workers)).max(1);
            match self.next.compare_exchange_weak(
                start,
                start + chunk,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(start..start + chunk),
                Err(observed) => start = observed,
            }
        }
    }
}

#[derive(Default)]
struct Collected {
    histogram: ByteHistogram,
    total_size: u64,
    bit_budget: u64,
}

fn collect_frequencies(inputs: &[String], workers: usize) -> Collected {
    let queue = GuidedQueue::new(inputs.len(), workers);
    let merged = Mutex::new(Collected::default());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let mut local = Collected::default();
                let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];
                while let Some(range) = queue.take() {
                    for index in range {
                        let input = &inputs[index];
                        local.histogram.record_slice(input.as_bytes());
                        if let Err(error) =
                            scan_input(Path::new(input), &mut local, &mut read_buffer)
                        {
                            warn!(input = %input, %error, "skipping unreadable input during analysis");
                        }
                    }
                }
                let mut shared = lock(&merged);
                shared.histogram.merge(&local.histogram);
                shared.total_size += local.total_size;
                shared.bit_budget += local.bit_budget;
            });
        }
    });

    merged.into_inner().unwrap_or_else(PoisonError::into_inner)
}

fn scan_input(
    path: &Path,
    local: &mut Collected,
    read_buffer: &mut [u8],
) -> std::io::Result<()> {
    let metadata = fs::metadata(path)?;
    if metadata.is_dir() {
        scan_folder(path, local, read_buffer)
    } else {
        scan_file(path, metadata.len(), local, read_buffer)
    }
}

fn scan_file(
    path: &Path,
    size: u64,
    local: &mut Collected,
    read_buffer: &mut [u8],
) -> std::io::Result<()> {
    local.total_size += size;
    local.bit_budget += FILE_SIZE_FIELD_BITS;
    let mut file = File::open(path)?;
    loop {
        let read = file.read(read_buffer)?;
        if read == 0 {
            return Ok(());
        }
        local.histogram.record_slice(&read_buffer[..read]);
    }
}

fn scan_folder(
    path: &Path,
    local: &mut Collected,
    read_buffer: &mut [u8],
) -> std::io::Result<()> {
    local.total_size += DIRECTORY_WEIGHT;
    local.bit_budget += CHILD_COUNT_FIELD_BITS;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        local.bit_budget += ENTRY_OVERHEAD_BITS;
        let name = entry.file_name();
        local.histogram.record_slice(name.to_string_lossy().as_bytes());

        let child = entry.path();
        let metadata = fs::metadata(&child)?;
        if metadata.is_dir() {
            scan_folder(&child, local, read_buffer)?;
        } else {
            scan_file(&child, metadata.len(), local, read_buffer)?;
        }
    }
    Ok(())
}

struct WorkerOutput {
    /// `(input index, encoded record)` in the order this worker produced them.
    produced: Vec<(usize, Vec<u8>)>,
}

fn encode_payloads(
    inputs: &[String],
    code_book: &CodeBook,
    workers: usize,
    progress: Option<&dyn ProgressObserver>,
) -> Result<Vec<WorkerOutput>, ArchiveError> {
    let queue = GuidedQueue::new(inputs.len(), workers);
    let abort = AtomicBool::new(false);
    let failure = Mutex::new(None::<ArchiveError>);

    let outputs = std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let queue = &queue;
            let abort = &abort;
            let failure = &failure;
            handles.push(scope.spawn(move || {
                let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];
                let mut produced = Vec::new();
                'ranges: while let Some(range) = queue.take() {
                    for index in range {
                        if abort.load(Ordering::Acquire) {
                            break 'ranges;
                        }
                        match encode_top_level(
                            Path::new(&inputs[index]),
                            code_book,
                            &mut read_buffer,
                            progress,
                        ) {
                            Ok(Some(buffer)) => produced.push((index, buffer)),
                            Ok(None) => {}
                            Err(error) => {
                                let mut slot = lock(failure);
                                if slot.is_none() {
                                    *slot = Some(error);
                                }
                                abort.store(true, Ordering::Release);
                                break 'ranges;
                            }
                        }
                    }
                }
                WorkerOutput { produced }
            }));
        }

        let mut outputs = Vec::with_capacity(workers);
        for handle in handles {
            match handle.join() {
                Ok(output) => outputs.push(output),
                Err(_) => {
                    let mut slot = lock(&failure);
                    if slot.is_none() {
                        *slot = Some(ArchiveError::Internal("encoder worker panicked"));
                    }
                }
            }
        }
        outputs
    });

    if let Some(error) = lock(&failure).take() {
        return Err(error);
    }
    Ok(outputs)
}

/// Encodes one top-level input into its own byte-aligned record. An input
/// that cannot be opened is logged and elided (`Ok(None)`), matching the
/// recoverable-failure policy; failures deeper inside a folder are fatal
/// because the folder's child count has already been committed.
fn encode_top_level(
    path: &Path,
    code_book: &CodeBook,
    read_buffer: &mut [u8],
    progress: Option<&dyn ProgressObserver>,
) -> Result<Option<Vec<u8>>, ArchiveError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!(input = %path.display(), %error, "skipping unreadable input during encoding");
            return Ok(None);
        }
    };

    if metadata.is_dir() {
        let mut writer = BitWriter::new();
        writer.write_bit(false);
        write_folder(path, code_book, &mut writer, read_buffer, progress)?;
        return Ok(Some(writer.finish()));
    }

    let size = metadata.len();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) => {
            warn!(input = %path.display(), %error, "skipping unreadable input during encoding");
            return Ok(None);
        }
    };
    let mut writer =
        BitWriter::with_capacity((size / OUTPUT_ESTIMATE_DIVISOR) as usize + 16);
    writer.write_bit(true);
    writer.write_u64_be(size);
    encode_file_content(file, size, path, code_book, &mut writer, read_buffer, progress)?;
    Ok(Some(writer.finish()))
}

fn write_folder(
    path: &Path,
    code_book: &CodeBook,
    writer: &mut BitWriter,
    read_buffer: &mut [u8],
    progress: Option<&dyn ProgressObserver>,
) -> Result<(), ArchiveError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(|source| read_input(path, source))? {
        entries.push(entry.map_err(|source| read_input(path, source))?);
    }
    let child_count = u16::try_from(entries.len())
        .map_err(|_| ArchiveError::TooManyChildren(path.to_path_buf()))?;
    writer.write_u16_le(child_count);

    for entry in entries {
        let child = entry.path();
        let file_name = entry.file_name();
        let name = file_name
            .to_str()
            .ok_or_else(|| ArchiveError::NonUtf8Name(child.clone()))?;
        if name.len() > MAX_NAME_LEN {
            return Err(ArchiveError::NameTooLong(child));
        }

        let metadata = fs::metadata(&child).map_err(|source| read_input(&child, source))?;
        if metadata.is_dir() {
            writer.write_bit(false);
            write_name(name, code_book, writer)?;
            write_folder(&child, code_book, writer, read_buffer, progress)?;
        } else {
            let size = metadata.len();
            let file = File::open(&child).map_err(|source| read_input(&child, source))?;
            writer.write_bit(true);
            writer.write_u64_be(size);
            write_name(name, code_book, writer)?;
            writer.reserve((size / OUTPUT_ESTIMATE_DIVISOR) as usize);
            encode_file_content(file, size, &child, code_book, writer, read_buffer, progress)?;
        }
    }
    Ok(())
}

fn write_name(
    name: &str,
    code_book: &CodeBook,
    writer: &mut BitWriter,
) -> Result<(), ArchiveError> {
    writer.write_u8(name.len() as u8);
    for &byte in name.as_bytes() {
        let code = code_book
            .code(byte)
            .ok_or(ArchiveError::Internal("name byte has no assigned code"))?;
        writer.write_code(code);
    }
    Ok(())
}

fn encode_file_content(
    mut file: File,
    size: u64,
    path: &Path,
    code_book: &CodeBook,
    writer: &mut BitWriter,
    read_buffer: &mut [u8],
    progress: Option<&dyn ProgressObserver>,
) -> Result<(), ArchiveError> {
    let mut encoded: u64 = 0;
    loop {
        let read = file
            .read(read_buffer)
            .map_err(|source| read_input(path, source))?;
        if read == 0 {
            break;
        }
        for &byte in &read_buffer[..read] {
            let code = code_book
                .code(byte)
                .ok_or(ArchiveError::Internal("byte has no assigned code"))?;
            writer.write_code(code);
        }
        encoded += read as u64;
        if let Some(observer) = progress {
            observer.advance(read as u64);
        }
    }
    if encoded != size {
        return Err(ArchiveError::Internal("input changed size during encoding"));
    }
    Ok(())
}

fn read_input(path: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::ReadInput {
        path: path.to_path_buf(),
        source,
    }
}

/// Serializes the archive header: letter count, password block, code table
/// and the 16-bit file count, zero-padded to a byte boundary so the
/// byte-aligned worker records concatenate losslessly after it.
fn encode_header(
    code_book: &CodeBook,
    password: Option<&str>,
    file_count: u16,
) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = BitWriter::new();
    writer.write_u8((code_book.len() % 256) as u8);

    match password {
        Some(password) => {
            writer.write_u8(password.len() as u8);
            for byte in password.bytes() {
                writer.write_u8(byte);
            }
        }
        None => writer.write_u8(0),
    }

    for leaf in code_book.leaves() {
        let code = code_book
            .code(leaf.byte)
            .ok_or(ArchiveError::Internal("leaf byte has no assigned code"))?;
        writer.write_u8(leaf.byte);
        writer.write_u8(code.len);
        writer.write_code(code);
    }

    writer.write_u16_le(file_count);
    Ok(writer.finish())
}

fn write_output(
    path: &Path,
    header: &[u8],
    payloads: &[(usize, Vec<u8>)],
) -> Result<u64, ArchiveError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    writer.write_all(header)?;
    let mut written = header.len() as u64;
    for (_, payload) in payloads {
        writer.write_all(payload)?;
        written += payload.len() as u64;
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests;
