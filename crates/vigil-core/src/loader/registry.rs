//! Type tables exported by code units.
//!
//! A code unit does not expose its types through reflection. Instead it
//! ships a registration table of [`TypeDescriptor`]s, each describing the
//! shape of one exported type and, when it has one, its zero-argument
//! constructor.

use crate::detector::Detector;
use crate::error::LoadErrorReason;

/// Version of the code-unit ABI. Dynamic libraries built against another
/// version are rejected.
pub const ABI_VERSION: u32 = 1;

/// Zero-argument constructor of a detector type.
pub type Constructor = fn() -> Result<Box<dyn Detector>, String>;

/// Static facts about an exported type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeShape {
    pub implements_detector: bool,
    pub is_abstract: bool,
    pub is_generic: bool,
}

/// One entry of a code unit's type table.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    name: String,
    shape: TypeShape,
    constructor: Option<Constructor>,
}

fn construct_default<T: Detector + Default + 'static>() -> Result<Box<dyn Detector>, String> {
    Ok(Box::new(T::default()))
}

const DETECTOR: TypeShape = TypeShape {
    implements_detector: true,
    is_abstract: false,
    is_generic: false,
};

impl TypeDescriptor {
    /// A concrete detector built with `T::default()`.
    pub fn detector<T: Detector + Default + 'static>(name: impl Into<String>) -> Self {
        Self::with_constructor(name, construct_default::<T>)
    }

    /// A concrete detector with a fallible constructor.
    pub fn with_constructor(name: impl Into<String>, constructor: Constructor) -> Self {
        Self {
            name: name.into(),
            shape: DETECTOR,
            constructor: Some(constructor),
        }
    }

    /// A detector base type that cannot be instantiated.
    pub fn abstract_detector(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: TypeShape {
                is_abstract: true,
                ..DETECTOR
            },
            constructor: None,
        }
    }

    /// A detector with unbound type parameters.
    pub fn generic_detector(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: TypeShape {
                is_generic: true,
                ..DETECTOR
            },
            constructor: None,
        }
    }

    /// A detector that needs constructor arguments.
    pub fn detector_without_default(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: DETECTOR,
            constructor: None,
        }
    }

    /// A type that does not implement [`Detector`].
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: TypeShape::default(),
            constructor: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> TypeShape {
        self.shape
    }

    /// Check that this type can serve as a module entry point.
    pub(crate) fn validate(&self) -> Result<Constructor, (LoadErrorReason, String)> {
        let name = &self.name;
        if !self.shape.implements_detector {
            return Err((
                LoadErrorReason::TypeNotCapability,
                format!("type '{}' does not implement the detector capability", name),
            ));
        }
        if self.shape.is_abstract {
            return Err((
                LoadErrorReason::TypeAbstract,
                format!("type '{}' is abstract", name),
            ));
        }
        if self.shape.is_generic {
            return Err((
                LoadErrorReason::TypeGeneric,
                format!("type '{}' is an open generic type", name),
            ));
        }
        self.constructor.ok_or_else(|| {
            (
                LoadErrorReason::NoDefaultConstructor,
                format!("type '{}' has no zero-argument constructor", name),
            )
        })
    }
}

/// The type table of one code unit.
#[derive(Debug, Clone, Default)]
pub struct CodeUnit {
    name: String,
    types: Vec<TypeDescriptor>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
        }
    }

    pub fn with_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.push(descriptor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn types(&self) -> &[TypeDescriptor] {
        &self.types
    }

    /// Look up a type by its fully qualified name.
    pub fn find(&self, type_name: &str) -> Option<&TypeDescriptor> {
        self.types.iter().find(|t| t.name == type_name)
    }
}

/// Export a code unit from a `cdylib` package crate.
///
/// ```ignore
/// fn unit() -> vigil_core::loader::CodeUnit {
///     CodeUnit::new("d1main").with_type(TypeDescriptor::detector::<MyDetector>("D1.Detector"))
/// }
/// vigil_core::export_code_unit!(unit);
/// ```
///
/// The package must be built with the same toolchain and `vigil-core`
/// version as the worker that loads it.
#[macro_export]
macro_rules! export_code_unit {
    ($build:path) => {
        #[unsafe(no_mangle)]
        pub fn vigil_abi_version() -> u32 {
            $crate::loader::ABI_VERSION
        }

        #[unsafe(no_mangle)]
        pub fn vigil_code_unit() -> $crate::loader::CodeUnit {
            $build()
        }
    };
}
