use std::fmt::Display;
use std::io::Write;

/// Prefix of phase transition lines on stdout
pub const PROGRESS_PREFIX: &str = "PROGRESS: ";
/// Prefix of the single fatal failure line on stdout
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Upscale phases in the order they are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Network description is being built
    Init,
    /// Weights file is absent and being fetched
    Download,
    /// Weights are loaded into the engine
    Load,
    /// Input image is decoded
    Read,
    /// Inference runs
    Process,
    /// Output image is encoded
    Save,
    /// Run finished
    Done,
}

impl Phase {
    /// Human-readable text following the progress prefix
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Init => "Инициализация модели...",
            Self::Download => "Скачивание модели...",
            Self::Load => "Загрузка модели...",
            Self::Read => "Загрузка изображения...",
            Self::Process => "Обработка изображения...",
            Self::Save => "Сохранение результата...",
            Self::Done => "Готово!",
        }
    }
}

/// Writes the line protocol an external supervisor follows
///
/// Every line is flushed as soon as it is written so an observer reading
/// the pipe sees phases in real time.
pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    /// Wraps an output stream (normally locked stdout)
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// Announces a phase transition
    pub fn phase(&mut self, phase: Phase) {
        tracing::debug!(?phase, "phase started");
        self.line(PROGRESS_PREFIX, &phase.message());
    }

    /// Reports the fatal failure of a run
    pub fn error(&mut self, message: &dyn Display) {
        self.line(ERROR_PREFIX, message);
    }

    /// Writes an unprefixed line, e.g. usage text
    pub fn plain(&mut self, message: &dyn Display) {
        self.line("", message);
    }

    /// Releases the underlying stream
    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, prefix: &str, message: &dyn Display) {
        // A closed stdout must not turn a successful run into a failed one
        if let Err(e) = writeln!(self.out, "{prefix}{message}").and_then(|()| self.out.flush()) {
            tracing::warn!(error = %e, "failed to write progress line");
        }
    }
}
