//! Analyzer components for recovery planning

pub mod dependency_analyzer;
pub mod dependency_graph;
pub mod risk_assessor;
pub mod signals;

pub use dependency_analyzer::DependencyAnalyzer;
pub use dependency_graph::DependencyGraph;
pub use risk_assessor::RiskAssessor;
pub use signals::{
    default_extractors, AnnotationExtractor, IngressBackendExtractor, NamespaceExtractor,
    OwnershipExtractor, ResourceIndex, ServiceSelectorExtractor, SignalExtractor, Signals,
    WorkloadReferenceExtractor, DEPENDS_ON_ANNOTATION, PRIORITY_ANNOTATION,
};
