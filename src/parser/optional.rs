//! Optional backend discovery
//!
//! The ML inference and GPU OCR adapters are capability discovery, not
//! compile-time linkage: at startup each is probed as a dynamic library
//! exporting a version symbol. Absence is not an error; the stages that
//! depend on a missing adapter report `not_available` in their results.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Library stem probed for the ML inference adapter
const ML_LIBRARY: &str = "docex_ml";
/// Library stem probed for the GPU OCR adapter
const GPU_OCR_LIBRARY: &str = "docex_gpu_ocr";

/// Version symbol each adapter must export: `fn() -> *const c_char`
type VersionFn = unsafe extern "C" fn() -> *const std::os::raw::c_char;

/// Inference entry point: `fn(task, input) -> *const c_char` returning
/// newline-separated results in a buffer owned by the library
type InferFn =
    unsafe extern "C" fn(*const std::os::raw::c_char, *const std::os::raw::c_char) -> *const std::os::raw::c_char;

/// Discovered optional capabilities, shared read-only across workers
pub struct OptionalBackends {
    ml: Option<LoadedAdapter>,
    gpu_ocr: Option<LoadedAdapter>,
}

struct LoadedAdapter {
    // Held for the process lifetime; dropping would unload the library
    library: libloading::Library,
    version: String,
}

impl LoadedAdapter {
    /// Call the adapter's inference symbol. `None` when the symbol is missing
    /// or the call yields nothing.
    fn infer(&self, symbol: &str, task: &str, input: &str) -> Option<Vec<String>> {
        let task_c = std::ffi::CString::new(task).ok()?;
        let input_c = std::ffi::CString::new(input).ok()?;
        unsafe {
            let f = self.library.get::<InferFn>(symbol.as_bytes()).ok()?;
            let ptr = f(task_c.as_ptr(), input_c.as_ptr());
            if ptr.is_null() {
                return None;
            }
            let out = std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned();
            Some(out.lines().map(str::to_string).collect())
        }
    }
}

impl OptionalBackends {
    /// Probe for the optional adapters under `model_dir` (when given) and the
    /// default library search path. Called once at startup.
    pub fn probe(model_dir: Option<&Path>) -> Self {
        let ml = load_adapter(ML_LIBRARY, model_dir);
        let gpu_ocr = load_adapter(GPU_OCR_LIBRARY, model_dir);
        if let Some(ref a) = ml {
            info!(version = %a.version, "ML adapter available");
        } else {
            debug!("ML adapter not present; ML stages will report not_available");
        }
        if let Some(ref a) = gpu_ocr {
            info!(version = %a.version, "GPU OCR adapter available");
        } else {
            debug!("GPU OCR adapter not present; OCR stages will report not_available");
        }
        Self { ml, gpu_ocr }
    }

    /// A probe result with neither adapter, for tests and dry runs
    pub fn absent() -> Self {
        Self {
            ml: None,
            gpu_ocr: None,
        }
    }

    pub fn ml_available(&self) -> bool {
        self.ml.is_some()
    }

    pub fn gpu_ocr_available(&self) -> bool {
        self.gpu_ocr.is_some()
    }

    pub fn ml_version(&self) -> Option<&str> {
        self.ml.as_ref().map(|a| a.version.as_str())
    }

    pub fn gpu_ocr_version(&self) -> Option<&str> {
        self.gpu_ocr.as_ref().map(|a| a.version.as_str())
    }

    /// ML inference call. `None` when the adapter or its entry point is absent.
    pub fn ml_infer(&self, task: &str, input: &str) -> Option<Vec<String>> {
        self.ml.as_ref()?.infer("docex_ml_infer", task, input)
    }

    /// GPU OCR inference call. `None` when the adapter or its entry point is
    /// absent.
    pub fn gpu_ocr_infer(&self, task: &str, input: &str) -> Option<Vec<String>> {
        self.gpu_ocr.as_ref()?.infer("docex_gpu_ocr_infer", task, input)
    }
}

/// Try the model dir first, then the platform default search path
fn load_adapter(stem: &str, model_dir: Option<&Path>) -> Option<LoadedAdapter> {
    let file = platform_library_name(stem);
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = model_dir {
        candidates.push(dir.join(&file));
    }
    candidates.push(PathBuf::from(&file));

    for candidate in candidates {
        // Safety: the library is only trusted to export the version symbol;
        // all other entry points go through the same checked loading path.
        let library = match unsafe { libloading::Library::new(&candidate) } {
            Ok(l) => l,
            Err(_) => continue,
        };
        let symbol_name = format!("{}_version", stem);
        let version = unsafe {
            match library.get::<VersionFn>(symbol_name.as_bytes()) {
                Ok(f) => {
                    let ptr = f();
                    if ptr.is_null() {
                        continue;
                    }
                    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
                }
                Err(_) => continue,
            }
        };
        return Some(LoadedAdapter { library, version });
    }
    None
}

fn platform_library_name(stem: &str) -> String {
    if cfg!(target_os = "macos") {
        format!("lib{}.dylib", stem)
    } else if cfg!(target_os = "windows") {
        format!("{}.dll", stem)
    } else {
        format!("lib{}.so", stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_without_libraries_degrades_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let backends = OptionalBackends::probe(Some(dir.path()));
        assert!(!backends.ml_available());
        assert!(!backends.gpu_ocr_available());
        assert_eq!(backends.ml_version(), None);
    }

    #[test]
    fn absent_reports_nothing() {
        let backends = OptionalBackends::absent();
        assert!(!backends.ml_available());
        assert!(!backends.gpu_ocr_available());
    }
}
