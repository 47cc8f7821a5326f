use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::interceptor::InterceptorCollection;
use crate::value::{PropertyValue, ValueKind};

/// 主体身份：共享分配的地址。指针同一性即主体同一性。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(usize);

impl fmt::Debug for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubjectId({:#x})", self.0)
    }
}

/// 派生属性的求值函数：通过上下文读取其它属性，读到的引用会被依赖记录器捕获。
pub type ComputeFn =
    dyn Fn(&SubjectContext, &SubjectHandle) -> Result<PropertyValue, CoreError> + Send + Sync;

/// 自定义写入函数：写穿底层状态（典型用于带 setter 的派生属性）。
pub type CustomWriteFn =
    dyn Fn(&SubjectContext, &SubjectHandle, &PropertyValue) -> Result<(), CoreError> + Send + Sync;

/// 属性校验器：拒绝写入时返回错误，校验失败不产生变更。
pub type Validator = dyn Fn(&PropertyRef, &PropertyValue) -> Result<(), CoreError> + Send + Sync;

/// 属性初始化器：主体挂接时对每个 (主体, 属性) 对执行一次，
/// 用于播种派生特性、默认值与绑定校验器。
pub type Initializer = dyn Fn(&SubjectContext, &SubjectHandle, &PropertySpec) + Send + Sync;

/// 属性的读取方式。`None` 表示只写属性。
#[derive(Clone)]
pub enum Reader {
    None,
    /// 从主体存储槽读取。
    Stored,
    /// 由求值函数计算（派生属性），结果缓存在存储槽中。
    Computed(Arc<ComputeFn>),
}

/// 属性的写入方式。`None` 表示只读属性。
#[derive(Clone)]
pub enum Writer {
    None,
    /// 写入主体存储槽。
    Stored,
    /// 写穿自定义底层状态；随后派生缓存按需失效。
    Custom(Arc<CustomWriteFn>),
}

/// 属性元数据：声明类型、读写函数与声明期附着的特性集。
///
/// # 契约说明（What）
/// - `name` 在主体内唯一，采用 camelCase；属性特性（attribute）的名称为
///   `基属性名@特性名`，特性本身也是一等属性。
/// - `reader`/`writer` 可空：空读取器即只写属性，空写入器即只读或派生属性。
/// - `validators` 在写入链中执行，失败即拒绝；`initializers` 在挂接时执行一次。
#[derive(Clone)]
pub struct PropertySpec {
    name: String,
    kind: ValueKind,
    reader: Reader,
    writer: Writer,
    attribute_of: Option<(String, String)>,
    validators: Vec<Arc<Validator>>,
    initializers: Vec<Arc<Initializer>>,
    source_hint: Option<String>,
}

impl fmt::Debug for PropertySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertySpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("derived", &self.is_derived())
            .field("attribute_of", &self.attribute_of)
            .finish()
    }
}

impl PropertySpec {
    /// 普通可读可写的存储属性。
    pub fn stored(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            reader: Reader::Stored,
            writer: Writer::Stored,
            attribute_of: None,
            validators: Vec::new(),
            initializers: Vec::new(),
            source_hint: None,
        }
    }

    /// 派生属性：读取即求值，依赖被自动记录，默认无写入器。
    pub fn derived(name: impl Into<String>, kind: ValueKind, compute: Arc<ComputeFn>) -> Self {
        Self {
            name: name.into(),
            kind,
            reader: Reader::Computed(compute),
            writer: Writer::None,
            attribute_of: None,
            validators: Vec::new(),
            initializers: Vec::new(),
            source_hint: None,
        }
    }

    /// 基属性上的特性；完整名称为 `base@attr`。
    pub fn attribute(base: &str, attr: &str, kind: ValueKind) -> Self {
        let mut spec = Self::stored(format!("{base}@{attr}"), kind);
        spec.attribute_of = Some((base.to_owned(), attr.to_owned()));
        spec
    }

    /// 派生特性：`base@attr`，读取即求值。
    pub fn derived_attribute(
        base: &str,
        attr: &str,
        kind: ValueKind,
        compute: Arc<ComputeFn>,
    ) -> Self {
        let mut spec = Self::derived(format!("{base}@{attr}"), kind, compute);
        spec.attribute_of = Some((base.to_owned(), attr.to_owned()));
        spec
    }

    /// 将属性改为只读（清空写入器）。
    pub fn read_only(mut self) -> Self {
        self.writer = Writer::None;
        self
    }

    /// 将属性改为只写（清空读取器）。
    pub fn write_only(mut self) -> Self {
        self.reader = Reader::None;
        self
    }

    /// 附加自定义写穿函数（典型用于带 setter 的派生属性）。
    pub fn with_custom_writer(mut self, writer: Arc<CustomWriteFn>) -> Self {
        self.writer = Writer::Custom(writer);
        self
    }

    /// 附加一个校验器。
    pub fn with_validator(mut self, validator: Arc<Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// 附加一个挂接初始化器。
    pub fn with_initializer(mut self, initializer: Arc<Initializer>) -> Self {
        self.initializers.push(initializer);
        self
    }

    /// 附加连接器路径提示。
    pub fn with_source_hint(mut self, hint: impl Into<String>) -> Self {
        self.source_hint = Some(hint.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self.reader, Reader::None)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.writer, Writer::None)
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.reader, Reader::Computed(_))
    }

    /// 若本属性是特性，返回 `(基属性名, 特性名)`。
    pub fn attribute_of(&self) -> Option<(&str, &str)> {
        self.attribute_of
            .as_ref()
            .map(|(base, attr)| (base.as_str(), attr.as_str()))
    }

    pub fn validators(&self) -> &[Arc<Validator>] {
        &self.validators
    }

    pub fn initializers(&self) -> &[Arc<Initializer>] {
        &self.initializers
    }

    pub fn source_hint(&self) -> Option<&str> {
        self.source_hint.as_deref()
    }
}

/// 主体类型的静态属性表。
///
/// # 设计背景（Why）
/// - 源生态用代码生成的访问器把读写路由进拦截链；在这里改为运行时形状表：
///   属性 id 即槽位下标，在形状构造时分配，访问统一经由
///   [`SubjectContext::read`] / [`SubjectContext::write`]。
///
/// # 契约说明（What）
/// - 属性名在形状内唯一；重复声明在构造期 panic（建模错误，不属于运行时错误）。
/// - 形状不可变；运行时新增的动态属性挂在实例上，不影响共享同一形状的其它主体。
pub struct SubjectShape {
    type_name: String,
    specs: Vec<Arc<PropertySpec>>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for SubjectShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectShape")
            .field("type_name", &self.type_name)
            .field("properties", &self.specs.len())
            .finish()
    }
}

impl SubjectShape {
    pub fn builder(type_name: impl Into<String>) -> ShapeBuilder {
        ShapeBuilder {
            type_name: type_name.into(),
            specs: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn specs(&self) -> &[Arc<PropertySpec>] {
        &self.specs
    }

    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

/// [`SubjectShape`] 构建器。
pub struct ShapeBuilder {
    type_name: String,
    specs: Vec<Arc<PropertySpec>>,
}

impl ShapeBuilder {
    /// 追加一个属性声明；属性 id 即追加顺序。
    pub fn property(mut self, spec: PropertySpec) -> Self {
        assert!(
            !self.specs.iter().any(|s| s.name() == spec.name()),
            "duplicate property `{}` on shape `{}`",
            spec.name(),
            self.type_name
        );
        self.specs.push(Arc::new(spec));
        self
    }

    pub fn build(self) -> Arc<SubjectShape> {
        let index = self
            .specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_owned(), i))
            .collect();
        Arc::new(SubjectShape {
            type_name: self.type_name,
            specs: self.specs,
            index,
        })
    }
}

/// 主体实例：形状 + 存储槽 + 动态属性扩展 + 数据袋 + 拦截器集合。
///
/// 多态是结构化的：任何形状的主体都通过同一套槽位/元数据机制参与拦截、
/// 登记与变更追踪，没有按类型的名义 trait。
pub struct SubjectInstance {
    context: SubjectContext,
    shape: Arc<SubjectShape>,
    slots: RwLock<Vec<PropertyValue>>,
    dynamic: RwLock<Vec<Arc<PropertySpec>>>,
    bag: DashMap<String, PropertyValue>,
    interceptors: InterceptorCollection,
}

/// 共享主体句柄；相等性与哈希基于指针同一性。
#[derive(Clone)]
pub struct SubjectHandle {
    inner: Arc<SubjectInstance>,
}

impl fmt::Debug for SubjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubjectHandle({}@{:#x})",
            self.inner.shape.type_name(),
            Arc::as_ptr(&self.inner) as usize
        )
    }
}

impl PartialEq for SubjectHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SubjectHandle {}

impl Hash for SubjectHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl SubjectHandle {
    /// 构造一个处于“未挂接”状态的主体；主体构造必须携带根上下文。
    pub fn new(context: &SubjectContext, shape: Arc<SubjectShape>) -> Self {
        let slots = vec![PropertyValue::Null; shape.specs().len()];
        Self {
            inner: Arc::new(SubjectInstance {
                context: context.clone(),
                shape,
                slots: RwLock::new(slots),
                dynamic: RwLock::new(Vec::new()),
                bag: DashMap::new(),
                interceptors: InterceptorCollection::new(),
            }),
        }
    }

    pub fn id(&self) -> SubjectId {
        SubjectId(Arc::as_ptr(&self.inner) as usize)
    }

    pub fn same_identity(&self, other: &Self) -> bool {
        self == other
    }

    pub fn context(&self) -> &SubjectContext {
        &self.inner.context
    }

    pub fn shape(&self) -> &Arc<SubjectShape> {
        &self.inner.shape
    }

    pub fn type_name(&self) -> &str {
        self.inner.shape.type_name()
    }

    /// 主体的拦截器集合（自有层 + 挂接时并入的继承层）。
    pub fn interceptors(&self) -> &InterceptorCollection {
        &self.inner.interceptors
    }

    /// 并发数据袋。
    pub fn data_bag(&self) -> &DashMap<String, PropertyValue> {
        &self.inner.bag
    }

    /// 按名称解析属性元数据：先查静态形状，再查动态扩展。
    pub fn spec_of(&self, name: &str) -> Option<Arc<PropertySpec>> {
        if let Some(slot) = self.inner.shape.slot_of(name) {
            return Some(self.inner.shape.specs()[slot].clone());
        }
        self.inner
            .dynamic
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// 属性的存储槽下标（静态属性为形状下标，动态属性顺延）。
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        if let Some(slot) = self.inner.shape.slot_of(name) {
            return Some(slot);
        }
        let base = self.inner.shape.specs().len();
        self.inner
            .dynamic
            .read()
            .iter()
            .position(|s| s.name() == name)
            .map(|i| base + i)
    }

    /// 枚举全部属性元数据：静态声明在前，动态扩展按加入顺序在后。
    pub fn properties(&self) -> Vec<Arc<PropertySpec>> {
        let mut out: Vec<_> = self.inner.shape.specs().to_vec();
        out.extend(self.inner.dynamic.read().iter().cloned());
        out
    }

    /// 读取存储槽的当前值（不经过拦截链）。
    pub(crate) fn storage_get(&self, slot: usize) -> PropertyValue {
        self.inner.slots.read()[slot].clone()
    }

    /// 覆写存储槽（不经过拦截链）。
    pub(crate) fn storage_set(&self, slot: usize, value: PropertyValue) {
        self.inner.slots.write()[slot] = value;
    }

    /// 挂载一个动态属性元数据并分配存储槽。
    pub(crate) fn push_dynamic(&self, spec: Arc<PropertySpec>) {
        self.inner.slots.write().push(PropertyValue::Null);
        self.inner.dynamic.write().push(spec);
    }

    /// 经拦截链读取属性。
    pub fn get(&self, name: &str) -> Result<PropertyValue, CoreError> {
        self.inner.context.read(self, name)
    }

    /// 经拦截链写入属性。
    pub fn set(&self, name: &str, value: impl Into<PropertyValue>) -> Result<(), CoreError> {
        self.inner.context.write(self, name, value.into()).map(|_| ())
    }
}

/// 属性引用：`(主体, 属性名)` 对，可比较、可哈希。
#[derive(Clone)]
pub struct PropertyRef {
    subject: SubjectHandle,
    name: Arc<str>,
}

impl PropertyRef {
    pub fn new(subject: SubjectHandle, name: &str) -> Self {
        Self {
            subject,
            name: Arc::from(name),
        }
    }

    pub fn subject(&self) -> &SubjectHandle {
        &self.subject
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> PropertyKey {
        PropertyKey {
            subject: self.subject.id(),
            name: self.name.clone(),
        }
    }

    pub fn spec(&self) -> Option<Arc<PropertySpec>> {
        self.subject.spec_of(&self.name)
    }
}

impl fmt::Debug for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.subject.type_name(), self.name)
    }
}

impl PartialEq for PropertyRef {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject && self.name == other.name
    }
}

impl Eq for PropertyRef {}

impl Hash for PropertyRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.subject.hash(state);
        self.name.hash(state);
    }
}

/// 属性键：`(主体 id, 属性名)`，用于不持有句柄的索引场景。
#[derive(Clone, Debug)]
pub struct PropertyKey {
    pub subject: SubjectId,
    pub name: Arc<str>,
}

impl PartialEq for PropertyKey {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject && self.name == other.name
    }
}

impl Eq for PropertyKey {}

impl Hash for PropertyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.subject.hash(state);
        self.name.hash(state);
    }
}
