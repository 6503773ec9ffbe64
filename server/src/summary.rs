//! Per-extension file analysers behind a pluggable trait. Each analyser does
//! lightweight line matching — imports, type definitions, functions — never
//! full parsing.

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Default, Clone, Serialize)]
pub struct SummaryData {
    pub imports: Vec<String>,
    pub classes: Vec<String>,
    pub functions: Vec<String>,
}

pub trait FileAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;
    fn extensions(&self) -> &'static [&'static str];
    fn analyze(&self, content: &str) -> SummaryData;
}

fn captures_of(re: &Regex, content: &str) -> Vec<String> {
    re.captures_iter(content)
        .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Language analysers
// ---------------------------------------------------------------------------

struct PythonAnalyzer;

impl FileAnalyzer for PythonAnalyzer {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn analyze(&self, content: &str) -> SummaryData {
        let import_re =
            Regex::new(r"(?m)^(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))").unwrap();
        let class_re = Regex::new(r"(?m)^class\s+(\w+)").unwrap();
        let fn_re = Regex::new(r"(?m)^\s*(?:async\s+)?def\s+(\w+)").unwrap();
        SummaryData {
            imports: captures_of(&import_re, content),
            classes: captures_of(&class_re, content),
            functions: captures_of(&fn_re, content),
        }
    }
}

struct JsAnalyzer;

impl FileAnalyzer for JsAnalyzer {
    fn name(&self) -> &'static str {
        "javascript"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["js", "ts", "jsx", "tsx", "mjs", "cjs"]
    }

    fn analyze(&self, content: &str) -> SummaryData {
        let import_re = Regex::new(
            r#"(?:from\s+['"]([^'"]+)['"]|require\s*\(\s*['"]([^'"]+)['"]\s*\))"#,
        )
        .unwrap();
        let class_re = Regex::new(r"(?m)^\s*(?:export\s+)?class\s+(\w+)").unwrap();
        let fn_re = Regex::new(
            r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s+(\w+)|(?m)^\s*const\s+(\w+)\s*=\s*(?:async\s*)?\(",
        )
        .unwrap();
        SummaryData {
            imports: captures_of(&import_re, content),
            classes: captures_of(&class_re, content),
            functions: captures_of(&fn_re, content),
        }
    }
}

struct RustAnalyzer;

impl FileAnalyzer for RustAnalyzer {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn analyze(&self, content: &str) -> SummaryData {
        let import_re = Regex::new(r"(?m)^\s*use\s+([\w:]+)").unwrap();
        let class_re =
            Regex::new(r"(?m)^\s*(?:pub(?:\([\w\s:]+\))?\s+)?(?:struct|enum|trait)\s+(\w+)")
                .unwrap();
        let fn_re =
            Regex::new(r"(?m)^\s*(?:pub(?:\([\w\s:]+\))?\s+)?(?:async\s+)?fn\s+(\w+)").unwrap();
        SummaryData {
            imports: captures_of(&import_re, content),
            classes: captures_of(&class_re, content),
            functions: captures_of(&fn_re, content),
        }
    }
}

struct GoAnalyzer;

impl FileAnalyzer for GoAnalyzer {
    fn name(&self) -> &'static str {
        "go"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn analyze(&self, content: &str) -> SummaryData {
        let import_re = Regex::new(r#""([^"]+)""#).unwrap();
        let import_block_re = Regex::new(r"(?s)import\s*\((.*?)\)").unwrap();
        let class_re = Regex::new(r"(?m)^type\s+(\w+)\s+(?:struct|interface)").unwrap();
        let fn_re = Regex::new(r"(?m)^func\s+(?:\([^)]*\)\s+)?(\w+)").unwrap();

        let imports = import_block_re
            .captures(content)
            .and_then(|cap| cap.get(1))
            .map(|block| captures_of(&import_re, block.as_str()))
            .unwrap_or_default();

        SummaryData {
            imports,
            classes: captures_of(&class_re, content),
            functions: captures_of(&fn_re, content),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct AnalyzerRegistry {
    analyzers: Vec<Box<dyn FileAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self {
            analyzers: vec![
                Box::new(PythonAnalyzer),
                Box::new(JsAnalyzer),
                Box::new(RustAnalyzer),
                Box::new(GoAnalyzer),
            ],
        }
    }

    pub fn for_extension(&self, extension: &str) -> Option<&dyn FileAnalyzer> {
        let ext = extension.trim_start_matches('.');
        self.analyzers
            .iter()
            .find(|a| a.extensions().contains(&ext))
            .map(|a| a.as_ref())
    }

    /// Analyse content by extension; unknown extensions get an empty summary.
    pub fn analyze(&self, extension: &str, content: &str) -> SummaryData {
        match self.for_extension(extension) {
            Some(analyzer) => analyzer.analyze(content),
            None => SummaryData::default(),
        }
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_summary() {
        let registry = AnalyzerRegistry::new();
        let summary = registry.analyze(
            "py",
            "import os\nfrom pathlib import Path\n\nclass Indexer:\n    def refresh(self):\n        pass\n\ndef main():\n    pass\n",
        );
        assert_eq!(summary.imports, vec!["os", "pathlib"]);
        assert_eq!(summary.classes, vec!["Indexer"]);
        assert_eq!(summary.functions, vec!["refresh", "main"]);
    }

    #[test]
    fn test_rust_summary() {
        let registry = AnalyzerRegistry::new();
        let summary = registry.analyze(
            "rs",
            "use std::fs;\n\npub struct Walker;\n\nimpl Walker {\n    pub fn walk(&self) {}\n}\n\nfn helper() {}\n",
        );
        assert_eq!(summary.imports, vec!["std::fs"]);
        assert_eq!(summary.classes, vec!["Walker"]);
        assert!(summary.functions.contains(&"walk".to_string()));
        assert!(summary.functions.contains(&"helper".to_string()));
    }

    #[test]
    fn test_go_summary() {
        let registry = AnalyzerRegistry::new();
        let summary = registry.analyze(
            "go",
            "package main\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\ntype Server struct{}\n\nfunc (s *Server) Run() {}\n\nfunc main() {}\n",
        );
        assert_eq!(summary.imports, vec!["fmt", "os"]);
        assert_eq!(summary.classes, vec!["Server"]);
        assert_eq!(summary.functions, vec!["Run", "main"]);
    }

    #[test]
    fn test_unknown_extension_empty_summary() {
        let registry = AnalyzerRegistry::new();
        let summary = registry.analyze("bin", "whatever");
        assert!(summary.imports.is_empty());
        assert!(summary.functions.is_empty());
    }
}
