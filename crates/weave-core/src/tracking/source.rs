//! 线程本地的“当前变更来源”栈。
//!
//! 入站桥在应用更新的整个调用期间以 [`SourceScope`] 压入自己的身份，
//! 期间提交的所有变更都会带上该标签；守卫离开作用域时自动弹出。

use std::cell::RefCell;

use crate::tracking::change::SourceTag;

thread_local! {
    static CURRENT_SOURCE: RefCell<Vec<SourceTag>> = const { RefCell::new(Vec::new()) };
}

/// 来源作用域守卫：构造时压栈，析构时弹栈。
pub struct SourceScope {
    _private: (),
}

impl SourceScope {
    pub fn enter(tag: SourceTag) -> Self {
        CURRENT_SOURCE.with(|stack| stack.borrow_mut().push(tag));
        Self { _private: () }
    }
}

impl Drop for SourceScope {
    fn drop(&mut self) {
        CURRENT_SOURCE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// 当前线程栈顶的来源标签。
pub fn current_source() -> Option<SourceTag> {
    CURRENT_SOURCE.with(|stack| stack.borrow().last().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_scope_nests_and_restores() {
        assert!(current_source().is_none());
        {
            let _outer = SourceScope::enter(SourceTag::new("bridge-a"));
            assert_eq!(current_source().unwrap().as_str(), "bridge-a");
            {
                let _inner = SourceScope::enter(SourceTag::new("bridge-b"));
                assert_eq!(current_source().unwrap().as_str(), "bridge-b");
            }
            assert_eq!(current_source().unwrap().as_str(), "bridge-a");
        }
        assert!(current_source().is_none(), "守卫析构后必须恢复为空");
    }
}
