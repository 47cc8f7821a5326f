use thiserror::Error;

/// 稳定错误码表，遵循 `域.语义` 命名约定。
///
/// 错误码面向日志、指标与跨进程桥接，一经发布不得变更字面值；
/// 新增语义时追加新码而非复用旧码。
pub mod codes {
    /// 写入违反属性声明的校验约束。
    pub const VALIDATION_REJECTED: &str = "weave.validation.rejected";
    /// 派生属性在求值过程中重入自身。
    pub const DERIVATION_CYCLE: &str = "weave.derived.cycle";
    /// 更新载荷与目标属性声明类型不符。
    pub const TYPE_MISMATCH: &str = "weave.update.type_mismatch";
    /// 访问了主体上不存在的属性。
    pub const UNKNOWN_PROPERTY: &str = "weave.subject.unknown_property";
    /// 对只读属性执行写入，或对只写属性执行读取。
    pub const ACCESS_DENIED: &str = "weave.subject.access_denied";
    /// 属性变更投影到的目标类型与存储值不符。
    pub const PROJECTION_MISMATCH: &str = "weave.change.projection_mismatch";
    /// 更新应用过程中的其它内部异常。
    pub const INTERNAL: &str = "weave.update.internal";
}

/// `CoreError` 是核心引擎向调用方暴露的统一错误域。
///
/// # 设计背景（Why）
/// - 校验失败与派生环路必须在读写现场同步浮出；其余错误（类型不符、内部异常）
///   由更新应用路径按“记录并跳过”或“汇报给对端”的策略消化。
/// - 每个变体绑定稳定错误码（见 [`codes`]），供日志与桥接层做精确分类。
///
/// # 契约说明（What）
/// - **传播策略**：桥内错误不跨桥传播；订阅者错误不回传发射上下文；
///   上下文本身仅在读写现场同步暴露校验与环路错误。
/// - **后置条件**：错误可安全跨线程移动（`Send + Sync + 'static`）。
#[derive(Debug, Error)]
pub enum CoreError {
    /// 写入被属性校验器拒绝；不产生变更记录。
    #[error("validation rejected write to `{property}`: {reason}")]
    Validation { property: String, reason: String },

    /// 派生属性求值时重入自身，对本次读取是致命错误。
    #[error("derivation of `{property}` re-entered itself")]
    DerivationCycle { property: String },

    /// 值的实际类型与属性声明类型不符。
    #[error("type mismatch on `{property}`: expected {expected}, got {actual}")]
    TypeMismatch {
        property: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// 主体上不存在请求的属性。
    #[error("subject has no property named `{property}`")]
    UnknownProperty { property: String },

    /// 属性的读/写能力与请求方向不符。
    #[error("property `{property}` is not {direction}")]
    AccessDenied {
        property: String,
        direction: &'static str,
    },

    /// 变更记录的类型投影失败。
    #[error("change projection on `{property}` expected {expected}")]
    ProjectionMismatch {
        property: String,
        expected: &'static str,
    },

    /// 其它内部异常；对外部对端只汇报泛化描述，完整信息落在服务端日志。
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    /// 返回变体对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => codes::VALIDATION_REJECTED,
            Self::DerivationCycle { .. } => codes::DERIVATION_CYCLE,
            Self::TypeMismatch { .. } => codes::TYPE_MISMATCH,
            Self::UnknownProperty { .. } => codes::UNKNOWN_PROPERTY,
            Self::AccessDenied { .. } => codes::ACCESS_DENIED,
            Self::ProjectionMismatch { .. } => codes::PROJECTION_MISMATCH,
            Self::Internal { .. } => codes::INTERNAL,
        }
    }

    /// 构造内部错误的便捷入口。
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
